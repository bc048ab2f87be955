//! Lookout - poke running machines whose health data went stale
//!
//! Every running machine without a snapshot inside the freshness window gets
//! a warning and one ping through the watcher. Probes run concurrently.
//! Repeatedly unreachable machines trip a per-machine circuit breaker and
//! are left alone for a cooldown; a fleet-wide token bucket bounds how many
//! probes one sweep may fire.

use crate::comms::{Action, Watcher};
use crate::error::Result;
use crate::logbook::{Logbook, MachineStatus};
use crate::manifest::LookoutConfig;
use crate::periodic::Job;
use async_trait::async_trait;
use breaker_machines::{CircuitBreaker, CircuitBuilder};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use throttle_machines::token_bucket;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stale: Vec<String>,
    pub probed: Vec<String>,
    pub failed: Vec<String>,
    pub suspended: Vec<String>,
    pub throttled: Vec<String>,
}

struct ProbeGuard {
    breaker: CircuitBreaker,
    opened_at: Option<Instant>,
}

/// Token bucket state, in seconds since the lookout was built
struct ProbeBudget {
    tokens: f64,
    last_refill: f64,
}

pub struct Lookout {
    logbook: Arc<dyn Logbook>,
    watcher: Arc<Watcher>,
    settings: LookoutConfig,
    guards: Mutex<HashMap<String, ProbeGuard>>,
    budget: Mutex<ProbeBudget>,
    epoch: Instant,
}

impl Lookout {
    pub fn new(logbook: Arc<dyn Logbook>, watcher: Arc<Watcher>, settings: LookoutConfig) -> Self {
        let budget = ProbeBudget {
            tokens: settings.probe_capacity,
            last_refill: 0.0,
        };
        Self {
            logbook,
            watcher,
            settings,
            guards: Mutex::new(HashMap::new()),
            budget: Mutex::new(budget),
            epoch: Instant::now(),
        }
    }

    /// One staleness sweep over the running fleet
    pub async fn sweep(&self) -> Result<SweepReport> {
        let running: Vec<_> = self
            .logbook
            .machines()
            .await?
            .into_iter()
            .filter(|m| m.status == MachineStatus::Running)
            .collect();
        let mut report = SweepReport::default();
        if running.is_empty() {
            debug!("No running machines, nothing to watch");
            return Ok(report);
        }

        let now = Utc::now();
        let window = self.settings.freshness();
        let mut probes = JoinSet::new();

        for machine in running {
            let fresh = match self.logbook.latest_snapshot(&machine.id).await {
                Ok(Some(snapshot)) => snapshot.is_fresh(now, window),
                Ok(None) => false,
                Err(e) => {
                    warn!(machine = %machine.id, error = %e, "Could not read latest snapshot");
                    continue;
                }
            };
            if fresh {
                continue;
            }

            warn!(
                machine = %machine.id,
                window_secs = window.as_secs(),
                "No recent health data for running machine"
            );
            report.stale.push(machine.id.clone());

            if !self.breaker_allows(&machine.id) {
                info!(machine = %machine.id, "Probes suspended after repeated failures");
                report.suspended.push(machine.id);
                continue;
            }
            if !self.take_token() {
                info!(machine = %machine.id, "Probe budget exhausted for this sweep");
                report.throttled.push(machine.id);
                continue;
            }

            let watcher = self.watcher.clone();
            let timeout = self.settings.probe_timeout();
            probes.spawn(async move {
                let started = Instant::now();
                let result = watcher
                    .send_safe_command(&machine.id, Action::Ping, timeout)
                    .await;
                (machine.id, started.elapsed(), result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (machine_id, took, result) = match joined {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(error = %e, "Probe task failed");
                    continue;
                }
            };
            match result {
                Ok(_) => {
                    debug!(machine = %machine_id, "Stale machine answered probe");
                    self.record_probe(&machine_id, true, took.as_secs_f64());
                }
                Err(e) => {
                    warn!(machine = %machine_id, error = %e, "Stale machine probe failed");
                    self.record_probe(&machine_id, false, took.as_secs_f64());
                    report.failed.push(machine_id.clone());
                }
            }
            report.probed.push(machine_id);
        }
        report.probed.sort();
        report.failed.sort();

        Ok(report)
    }

    /// Whether the machine's breaker lets a probe through, resetting it after cooldown
    fn breaker_allows(&self, machine_id: &str) -> bool {
        let mut guards = self.guards.lock();
        let Some(guard) = guards.get_mut(machine_id) else {
            return true;
        };
        if guard.breaker.is_closed() {
            return true;
        }
        let Some(opened) = guard.opened_at else {
            guard.opened_at = Some(Instant::now());
            return false;
        };
        if opened.elapsed() < self.settings.breaker_cooldown() {
            return false;
        }
        guard.breaker.reset();
        guard.opened_at = None;
        true
    }

    fn record_probe(&self, machine_id: &str, success: bool, took_secs: f64) {
        let mut guards = self.guards.lock();
        let guard = guards
            .entry(machine_id.to_string())
            .or_insert_with(|| self.new_guard(machine_id));
        if success {
            guard.breaker.record_success_and_maybe_close(took_secs);
        } else {
            guard.breaker.record_failure_and_maybe_trip(took_secs);
            if guard.breaker.is_open() && guard.opened_at.is_none() {
                guard.opened_at = Some(Instant::now());
            }
        }
    }

    fn new_guard(&self, machine_id: &str) -> ProbeGuard {
        ProbeGuard {
            breaker: CircuitBuilder::new(format!("lookout_{}", machine_id))
                .failure_threshold(self.settings.breaker_failure_threshold)
                .success_threshold(1)
                .half_open_timeout_secs(self.settings.breaker_cooldown_secs as f64)
                .build(),
            opened_at: None,
        }
    }

    fn take_token(&self) -> bool {
        let now_secs = self.epoch.elapsed().as_secs_f64();
        let mut budget = self.budget.lock();
        let result = token_bucket::check(
            budget.tokens,
            budget.last_refill,
            now_secs,
            self.settings.probe_capacity,
            self.settings.probe_refill_rate,
        );
        budget.tokens = result.new_tokens;
        budget.last_refill = now_secs;
        result.allowed
    }
}

#[async_trait]
impl Job for Lookout {
    fn name(&self) -> &'static str {
        "lookout"
    }

    async fn tick(&self) -> Result<()> {
        let report = self.sweep().await?;
        if !report.stale.is_empty() {
            info!(
                stale = report.stale.len(),
                probed = report.probed.len(),
                failed = report.failed.len(),
                "Lookout sweep finished"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::testing::{AgentMode, FakeConnector};
    use crate::logbook::JsonLogbook;
    use crate::manifest::HeartbeatConfig;
    use crate::sickbay::{CheckReport, HealthSnapshot};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        lookout: Lookout,
        logbook: Arc<JsonLogbook>,
        agent: Arc<FakeConnector>,
    }

    async fn rig(settings: LookoutConfig, machines: &[&str]) -> Rig {
        let logbook = Arc::new(JsonLogbook::in_memory());
        for id in machines {
            logbook.upsert_machine(id, &format!("{}-name", id)).await.unwrap();
            logbook
                .set_machine_status(id, MachineStatus::Running)
                .await
                .unwrap();
        }
        let agent = Arc::new(FakeConnector::new(AgentMode::Healthy));
        let watcher = Arc::new(Watcher::new(agent.clone(), HeartbeatConfig::default()));
        let lookout = Lookout::new(logbook.clone(), watcher, settings);
        Rig {
            lookout,
            logbook,
            agent,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_running_skips_sweep() {
        let rig = rig(LookoutConfig::default(), &[]).await;
        rig.logbook.upsert_machine("vm-1", "win-01").await.unwrap();

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(rig.agent.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_machine_probed_once_with_timeout() {
        let rig = rig(LookoutConfig::default(), &["vm-1", "vm-2"]).await;
        let fresh = HealthSnapshot::record("vm-2", None, CheckReport::Custom(json!({})), 1);
        rig.logbook.insert_snapshot(fresh).await.unwrap();

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.stale, vec!["vm-1"]);
        assert_eq!(report.probed, vec!["vm-1"]);
        assert!(report.failed.is_empty());

        let requests = rig.agent.requests_for("vm-1");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command, Action::Ping);
        assert_eq!(requests[0].timeout_ms, 30_000);
        assert!(rig.agent.requests_for("vm-2").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_snapshot_counts_as_stale() {
        let rig = rig(LookoutConfig::default(), &["vm-1"]).await;
        let mut old = HealthSnapshot::record("vm-1", None, CheckReport::Custom(json!({})), 1);
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        rig.logbook.insert_snapshot(old).await.unwrap();

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.probed, vec!["vm-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_logged_not_fatal() {
        let rig = rig(LookoutConfig::default(), &["vm-1", "vm-2"]).await;
        rig.agent.refuse(true);

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.probed, vec!["vm-1", "vm-2"]);
        assert_eq!(report.failed, vec!["vm-1", "vm-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_suspends_unreachable_machine() {
        let settings = LookoutConfig {
            breaker_failure_threshold: 2,
            ..LookoutConfig::default()
        };
        let rig = rig(settings, &["vm-1"]).await;
        rig.agent.refuse(true);

        rig.lookout.sweep().await.unwrap();
        rig.lookout.sweep().await.unwrap();
        let attempts = rig.agent.attempts();

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.suspended, vec!["vm-1"]);
        assert!(report.probed.is_empty());
        assert_eq!(rig.agent.attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_reopens_after_cooldown() {
        let settings = LookoutConfig {
            breaker_failure_threshold: 2,
            breaker_cooldown_secs: 60,
            ..LookoutConfig::default()
        };
        let rig = rig(settings, &["vm-1"]).await;
        rig.agent.refuse(true);
        rig.lookout.sweep().await.unwrap();
        rig.lookout.sweep().await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.suspended, vec!["vm-1"]);

        rig.agent.refuse(false);
        tokio::time::advance(Duration::from_secs(31)).await;
        let report = rig.lookout.sweep().await.unwrap();
        assert!(report.suspended.is_empty());
        assert_eq!(report.probed, vec!["vm-1"]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_budget_throttles() {
        let settings = LookoutConfig {
            probe_capacity: 1.0,
            probe_refill_rate: 0.001,
            ..LookoutConfig::default()
        };
        let rig = rig(settings, &["vm-1", "vm-2"]).await;

        let report = rig.lookout.sweep().await.unwrap();
        assert_eq!(report.probed.len(), 1);
        assert_eq!(report.throttled.len(), 1);
    }
}
