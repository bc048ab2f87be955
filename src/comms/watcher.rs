//! The Watcher - guest channel supervisor
//!
//! Owns one logical connection per machine:
//! - Opens channels lazily on first use
//! - Runs a heartbeat per open channel, counting unanswered pings
//! - Rebuilds the channel with exponential backoff once the failure
//!   threshold is reached, and gives up after a bounded number of attempts
//! - Feeds command traffic into the same keep-alive metrics

use crate::comms::dispatch::{Action, Dispatcher};
use crate::comms::link::{Connection, ConnectionSnapshot, LinkState};
use crate::comms::registry::ConnectionRegistry;
use crate::comms::transport::Connector;
use crate::error::{Error, Result};
use crate::manifest::HeartbeatConfig;
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Read-only view over every known connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Findings about a machine's channel, gathered without channel I/O
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub machine_id: String,
    pub diagnostics: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Result of asking the guest agent to describe itself
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentServiceStatus {
    pub installed: bool,
    pub running: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

pub struct Watcher {
    connector: Arc<dyn Connector>,
    registry: ConnectionRegistry,
    settings: HeartbeatConfig,
}

impl Watcher {
    pub fn new(connector: Arc<dyn Connector>, settings: HeartbeatConfig) -> Self {
        Self {
            connector,
            registry: ConnectionRegistry::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Send `action` to the guest agent and wait up to `timeout` for the reply
    ///
    /// A machine without a live channel gets exactly one connect attempt
    /// first. Replies, including explicit agent errors, count as received
    /// traffic; anything else counts as a keep-alive failure.
    pub async fn send_safe_command(
        &self,
        machine_id: &str,
        action: Action,
        timeout: Duration,
    ) -> Result<Value> {
        let conn = self.registry.get_or_create(machine_id);
        let channel = self.channel(&conn).await?;

        let name = action.name();
        conn.record_sent();
        let started = Instant::now();
        match channel.call(action, timeout).await {
            Ok(value) => {
                conn.record_reply(started.elapsed());
                Ok(value)
            }
            Err(e @ Error::Guest { .. }) => {
                conn.record_reply(started.elapsed());
                Err(e)
            }
            Err(e) => {
                let failures = conn.record_failure(&e.to_string());
                warn!(
                    machine = %machine_id,
                    action = name,
                    failures,
                    error = %e,
                    "Guest command failed"
                );
                if failures >= self.settings.failure_threshold {
                    conn.wake();
                }
                Err(e)
            }
        }
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let connections: Vec<_> = self.registry.all().iter().map(|c| c.snapshot()).collect();
        ConnectionStats {
            total_connections: connections.len(),
            active_connections: connections.iter().filter(|c| c.is_connected).count(),
            connections,
        }
    }

    /// Inspect a machine's connection state and transport endpoint
    pub async fn diagnose_socket_issues(&self, machine_id: &str) -> Diagnosis {
        let mut diagnostics = Vec::new();
        let mut recommendations = Vec::new();

        let probe = self.connector.probe_endpoint(machine_id).await;
        if probe.present {
            diagnostics.push(format!("Endpoint {} exists", probe.endpoint));
        } else {
            diagnostics.push(format!("Endpoint {} is missing", probe.endpoint));
            recommendations.push(
                "Check that the machine is running and its guest agent channel is attached"
                    .to_string(),
            );
        }
        if let Some(detail) = &probe.detail {
            diagnostics.push(format!("Endpoint detail: {}", detail));
            if probe.present {
                recommendations
                    .push("Remove the stale file so the hypervisor can recreate it".to_string());
            }
        }

        match self.registry.get(machine_id) {
            None => diagnostics.push("No connection has been opened yet".to_string()),
            Some(conn) => {
                let snap = conn.snapshot();
                diagnostics.push(format!("Connection state: {}", snap.state));
                diagnostics.push(format!(
                    "Keep-alive success rate: {} ({} sent, {} received)",
                    snap.success_rate, snap.metrics.sent_count, snap.metrics.received_count
                ));
                if snap.metrics.consecutive_failures > 0 {
                    diagnostics.push(format!(
                        "{} consecutive failures ({} total)",
                        snap.metrics.consecutive_failures, snap.metrics.failure_count
                    ));
                }
                if let Some(err) = &snap.last_error {
                    diagnostics.push(format!("Last error: {}", err));
                }
                if let Some(channel) = conn.live_channel() {
                    let counters = channel.counters();
                    diagnostics.push(format!(
                        "{} command(s) awaiting a reply, {} uncorrelated and {} malformed replies",
                        channel.in_flight(),
                        counters.uncorrelated(),
                        counters.malformed()
                    ));
                    if counters.malformed() > 0 {
                        recommendations.push(
                            "Guest agent sent unreadable replies; check its version".to_string(),
                        );
                    }
                }

                if snap.state == LinkState::Disconnected
                    && snap.reconnect_attempts >= self.settings.max_reconnect_attempts
                {
                    recommendations.push(
                        "Reconnection gave up; the next command will try once more".to_string(),
                    );
                }
                if snap.state == LinkState::Reconnecting {
                    recommendations.push(format!(
                        "Reconnect in progress (attempt {} of {})",
                        snap.reconnect_attempts, self.settings.max_reconnect_attempts
                    ));
                }
                if snap.metrics.received_count > 0
                    && snap.metrics.average_rtt_ms > self.settings.interval_ms as f64 / 2.0
                {
                    recommendations.push(
                        "Guest agent answers slowly; check guest CPU and memory pressure"
                            .to_string(),
                    );
                }
            }
        }

        Diagnosis {
            machine_id: machine_id.to_string(),
            diagnostics,
            recommendations,
        }
    }

    /// Ask the guest agent to describe itself
    pub async fn check_agent_service(&self, machine_id: &str) -> AgentServiceStatus {
        let timeout = self.settings.introspect_timeout();
        match self
            .send_safe_command(machine_id, Action::Introspect, timeout)
            .await
        {
            Ok(value) => AgentServiceStatus {
                installed: true,
                running: value
                    .get("service")
                    .and_then(Value::as_str)
                    .is_none_or(|s| s.eq_ignore_ascii_case("running")),
                version: value
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error: None,
            },
            Err(e @ Error::Connection { .. }) => AgentServiceStatus {
                installed: false,
                running: false,
                version: None,
                error: Some(e.to_string()),
            },
            Err(e) => AgentServiceStatus {
                installed: true,
                running: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Tear down and forget a machine's connection
    pub fn cleanup_vm_connection(&self, machine_id: &str) -> bool {
        match self.registry.remove(machine_id) {
            Some(conn) => {
                conn.retire();
                info!(machine = %machine_id, "Guest connection cleaned up");
                true
            }
            None => false,
        }
    }

    /// Tear down every connection
    pub fn shutdown(&self) {
        let connections = self.registry.drain();
        let count = connections.len();
        for conn in connections {
            conn.retire();
        }
        if count > 0 {
            info!(connections = count, "Guest connections closed");
        }
    }

    /// Live channel for `conn`, opening one if needed
    async fn channel(&self, conn: &Arc<Connection>) -> Result<Arc<Dispatcher>> {
        if let Some(channel) = conn.live_channel() {
            return Ok(channel);
        }
        let _attempt = conn.connect_lock.lock().await;
        if let Some(channel) = conn.live_channel() {
            return Ok(channel);
        }

        let channel = open_channel(self.connector.as_ref(), conn).await?;
        if conn.is_retired() {
            channel.close();
            return Err(Error::Connection {
                machine: conn.machine_id().to_string(),
                message: "connection was cleaned up".into(),
            });
        }
        if !conn.heartbeat_running() {
            let handle = tokio::spawn(heartbeat(
                self.connector.clone(),
                self.settings.clone(),
                conn.clone(),
            ));
            conn.set_heartbeat(handle);
        }
        Ok(channel)
    }
}

/// One connect attempt; the caller holds the connection's connect lock
async fn open_channel(connector: &dyn Connector, conn: &Connection) -> Result<Arc<Dispatcher>> {
    conn.begin_attempt();
    match connector.connect(conn.machine_id()).await {
        Ok(channel) => {
            info!(
                machine = %conn.machine_id(),
                endpoint = %channel.endpoint,
                "Guest channel established"
            );
            Ok(conn.established(Dispatcher::spawn(conn.machine_id(), channel)))
        }
        Err(e) => {
            warn!(machine = %conn.machine_id(), error = %e, "Guest connect failed");
            conn.attempt_failed(&e.to_string());
            Err(e)
        }
    }
}

/// Keep-alive loop for one connection
///
/// Exits when the connection is retired or reconnection gives up.
async fn heartbeat(connector: Arc<dyn Connector>, settings: HeartbeatConfig, conn: Arc<Connection>) {
    let interval = settings.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = conn.woken() => {}
        }
        if conn.is_retired() {
            return;
        }

        if conn.consecutive_failures() < settings.failure_threshold {
            if let Some(channel) = conn.live_channel() {
                ping(&conn, &channel, interval).await;
                if conn.consecutive_failures() < settings.failure_threshold
                    && !channel.is_closed()
                {
                    continue;
                }
            }
        }

        warn!(
            machine = %conn.machine_id(),
            failures = conn.consecutive_failures(),
            "Guest channel unhealthy, reconnecting"
        );
        if !reconnect(connector.as_ref(), &settings, &conn).await {
            return;
        }
        ticker.reset();
    }
}

/// Ping with a timeout equal to the heartbeat interval
async fn ping(conn: &Connection, channel: &Dispatcher, timeout: Duration) {
    conn.record_sent();
    let started = Instant::now();
    match channel.call(Action::Ping, timeout).await {
        Ok(_) => conn.record_reply(started.elapsed()),
        Err(e) => {
            let failures = conn.record_failure(&e.to_string());
            debug!(machine = %conn.machine_id(), failures, error = %e, "Heartbeat missed");
        }
    }
}

/// Rebuild the channel; returns false once the attempt budget is spent
async fn reconnect(connector: &dyn Connector, settings: &HeartbeatConfig, conn: &Connection) -> bool {
    conn.degrade();
    let backoff = ExponentialBackoff::new()
        .base_delay_ms(settings.reconnect_base_delay_ms)
        .max_delay_ms(settings.reconnect_max_delay_ms)
        .multiplier(2.0)
        .max_attempts(u8::MAX)
        .jitter_factor(0.0);
    let cap = Duration::from_millis(settings.reconnect_max_delay_ms);

    loop {
        if conn.reconnect_attempts() >= settings.max_reconnect_attempts {
            warn!(
                machine = %conn.machine_id(),
                attempts = settings.max_reconnect_attempts,
                "Giving up on guest channel"
            );
            conn.abandon();
            return false;
        }
        let attempt = conn.next_reconnect_attempt();
        let delay = backoff
            .delay(attempt.min(u8::MAX as u32) as u8, &mut rng())
            .map(Duration::from_millis)
            .unwrap_or(cap)
            .min(cap);
        debug!(machine = %conn.machine_id(), attempt, "Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;

        if conn.is_retired() {
            return false;
        }
        let _attempt = conn.connect_lock.lock().await;
        if conn.live_channel().is_some() {
            // A command got there first
            return true;
        }
        if open_channel(connector, conn).await.is_ok() {
            return true;
        }
    }
}
