//! Roll call - align stored machine status with the hypervisor
//!
//! Machines the hypervisor reports (by name or id) are RUNNING, every other
//! known machine is STOPPED. FAILED machines are left alone. A machine that
//! came up gets its queue processed; one that went down loses its channel.

use crate::comms::Watcher;
use crate::error::Result;
use crate::herald::{self, Herald};
use crate::hypervisor::Hypervisor;
use crate::logbook::{Logbook, MachineStatus};
use crate::periodic::Job;
use crate::quartermaster::Quartermaster;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Machines whose status changed in one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollCallReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

pub struct RollCall {
    logbook: Arc<dyn Logbook>,
    hypervisor: Arc<dyn Hypervisor>,
    quartermaster: Arc<Quartermaster>,
    watcher: Arc<Watcher>,
    herald: Herald,
}

impl RollCall {
    pub fn new(
        logbook: Arc<dyn Logbook>,
        hypervisor: Arc<dyn Hypervisor>,
        quartermaster: Arc<Quartermaster>,
        watcher: Arc<Watcher>,
        herald: Herald,
    ) -> Self {
        Self {
            logbook,
            hypervisor,
            quartermaster,
            watcher,
            herald,
        }
    }

    /// One reconciliation pass
    ///
    /// A failed hypervisor listing aborts the pass; per-machine failures are
    /// logged and skipped.
    pub async fn reconcile(&self) -> Result<RollCallReport> {
        let running: HashSet<String> = self.hypervisor.list_running().await?.into_iter().collect();
        let mut report = RollCallReport::default();

        for machine in self.logbook.machines().await? {
            if machine.status == MachineStatus::Failed {
                debug!(machine = %machine.id, "Skipping failed machine");
                continue;
            }

            let next = if running.contains(&machine.name) || running.contains(&machine.id) {
                MachineStatus::Running
            } else {
                MachineStatus::Stopped
            };
            if next == machine.status {
                continue;
            }

            if let Err(e) = self.logbook.set_machine_status(&machine.id, next).await {
                if e.is_not_found() {
                    debug!(machine = %machine.id, "Machine removed during roll call");
                } else {
                    warn!(machine = %machine.id, error = %e, "Could not update machine status");
                }
                continue;
            }
            info!(machine = %machine.id, from = %machine.status, to = %next, "Machine status changed");
            self.herald.publish(
                herald::MACHINE_STATUS_CHANGED,
                json!({
                    "machine_id": machine.id,
                    "name": machine.name,
                    "from": machine.status,
                    "to": next,
                }),
            );

            match next {
                MachineStatus::Running => {
                    let quartermaster = self.quartermaster.clone();
                    let id = machine.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = quartermaster.process_queue(&id).await {
                            warn!(machine = %id, error = %e, "Queue processing failed");
                        }
                    });
                    report.started.push(machine.id);
                }
                _ => {
                    self.watcher.cleanup_vm_connection(&machine.id);
                    report.stopped.push(machine.id);
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Job for RollCall {
    fn name(&self) -> &'static str {
        "roll-call"
    }

    async fn tick(&self) -> Result<()> {
        let report = self.reconcile().await?;
        if !report.started.is_empty() || !report.stopped.is_empty() {
            debug!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                "Roll call finished"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::Action;
    use crate::comms::testing::{AgentMode, FakeConnector};
    use crate::herald::Event;
    use crate::hypervisor::StaticHypervisor;
    use crate::logbook::JsonLogbook;
    use crate::manifest::{HeartbeatConfig, QueueConfig, RetryConfig};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Rig {
        roll_call: RollCall,
        logbook: Arc<JsonLogbook>,
        hypervisor: Arc<StaticHypervisor>,
        watcher: Arc<Watcher>,
        events: mpsc::Receiver<Event>,
    }

    async fn rig(running: &[&str]) -> Rig {
        let logbook = Arc::new(JsonLogbook::in_memory());
        logbook.upsert_machine("vm-1", "win-01").await.unwrap();
        logbook.upsert_machine("vm-2", "win-02").await.unwrap();
        logbook.upsert_machine("vm-3", "win-03").await.unwrap();

        let hypervisor = Arc::new(StaticHypervisor::new(running));
        let agent = Arc::new(FakeConnector::new(AgentMode::Healthy));
        let watcher = Arc::new(Watcher::new(agent, HeartbeatConfig::default()));
        let (herald, events) = Herald::channel();
        let quartermaster = Arc::new(Quartermaster::new(
            logbook.clone(),
            watcher.clone(),
            herald.clone(),
            QueueConfig::default(),
            &RetryConfig::default(),
        ));
        let roll_call = RollCall::new(
            logbook.clone(),
            hypervisor.clone(),
            quartermaster,
            watcher.clone(),
            herald,
        );
        Rig {
            roll_call,
            logbook,
            hypervisor,
            watcher,
            events,
        }
    }

    async fn status(logbook: &JsonLogbook, id: &str) -> MachineStatus {
        logbook.machine(id).await.unwrap().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_matches_by_name_or_id() {
        let mut rig = rig(&["win-01", "vm-2"]).await;
        let report = rig.roll_call.reconcile().await.unwrap();

        assert_eq!(report.started, vec!["vm-1", "vm-2"]);
        assert!(report.stopped.is_empty());
        assert_eq!(status(&rig.logbook, "vm-1").await, MachineStatus::Running);
        assert_eq!(status(&rig.logbook, "vm-3").await, MachineStatus::Stopped);

        let mut changes = 0;
        while let Ok(event) = rig.events.try_recv() {
            assert_eq!(event.topic, herald::MACHINE_STATUS_CHANGED);
            changes += 1;
        }
        assert_eq!(changes, 2);

        // steady state
        let report = rig.roll_call.reconcile().await.unwrap();
        assert_eq!(report, RollCallReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_machine_loses_connection() {
        let rig = rig(&["win-01"]).await;
        rig.roll_call.reconcile().await.unwrap();
        rig.watcher
            .send_safe_command("vm-1", Action::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rig.watcher.registry().get("vm-1").is_some());

        rig.hypervisor.set_running(&[]);
        let report = rig.roll_call.reconcile().await.unwrap();
        assert_eq!(report.stopped, vec!["vm-1"]);
        assert!(rig.watcher.registry().get("vm-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_machines_untouched() {
        let rig = rig(&["win-01", "win-02"]).await;
        rig.logbook
            .set_machine_status("vm-2", MachineStatus::Failed)
            .await
            .unwrap();

        let report = rig.roll_call.reconcile().await.unwrap();
        assert_eq!(report.started, vec!["vm-1"]);
        assert_eq!(status(&rig.logbook, "vm-2").await, MachineStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hypervisor_failure_aborts_tick() {
        let rig = rig(&["win-01"]).await;
        rig.hypervisor.set_unavailable();
        assert!(rig.roll_call.reconcile().await.is_err());
        assert_eq!(status(&rig.logbook, "vm-1").await, MachineStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_machine_queue_processed() {
        let rig = rig(&[]).await;
        let id = rig
            .roll_call
            .quartermaster
            .enqueue(
                "vm-1",
                crate::sickbay::CheckType::DiskSpace,
                crate::sickbay::Priority::High,
                None,
            )
            .await
            .unwrap();

        rig.hypervisor.set_running(&["win-01"]);
        rig.roll_call.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let task = rig.logbook.get_task(&id).await.unwrap();
        assert_eq!(task.status, crate::sickbay::TaskStatus::Completed);
    }
}
