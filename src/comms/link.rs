//! Per-machine connection state
//!
//! Lifecycle is driven by a dynamic state machine (state-machines crate):
//!
//! ```text
//! Disconnected --connect--> Connecting --established--> Connected
//!      ^                        |                          |
//!      +--------fail------------+                       degrade
//!      |                                                   v
//!      +---------------abandon------------------------ Reconnecting
//! ```

use crate::comms::dispatch::Dispatcher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use state_machines::state_machine;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

state_machine! {
    name: ConnectionMachine,
    dynamic: true,
    initial: Disconnected,
    states: [Disconnected, Connecting, Connected, Reconnecting],
    events {
        connect {
            transition: { from: Disconnected, to: Connecting }
        }
        established {
            transition: { from: [Connecting, Reconnecting], to: Connected }
        }
        fail {
            transition: { from: Connecting, to: Disconnected }
        }
        degrade {
            transition: { from: Connected, to: Reconnecting }
        }
        abandon {
            transition: { from: Reconnecting, to: Disconnected }
        }
        close {
            transition: { from: [Connecting, Connected, Reconnecting], to: Disconnected }
        }
    }
}

/// Connection lifecycle state for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl LinkState {
    fn from_machine(state: &str) -> Self {
        match state {
            "Connecting" => LinkState::Connecting,
            "Connected" => LinkState::Connected,
            "Reconnecting" => LinkState::Reconnecting,
            _ => LinkState::Disconnected,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "DISCONNECTED"),
            LinkState::Connecting => write!(f, "CONNECTING"),
            LinkState::Connected => write!(f, "CONNECTED"),
            LinkState::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Weight of the newest round-trip sample in the moving average
const RTT_SMOOTHING: f64 = 0.2;

/// Keep-alive and command traffic counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeepAliveMetrics {
    pub sent_count: u64,
    pub received_count: u64,
    /// Cumulative, never reset
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub average_rtt_ms: f64,
    pub last_sent: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl KeepAliveMetrics {
    pub fn record_sent(&mut self) {
        self.sent_count += 1;
        self.last_sent = Some(Utc::now());
    }

    pub fn record_reply(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        self.average_rtt_ms = if self.received_count == 0 {
            sample
        } else {
            RTT_SMOOTHING * sample + (1.0 - RTT_SMOOTHING) * self.average_rtt_ms
        };
        self.received_count += 1;
        self.consecutive_failures = 0;
        self.last_received = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(Utc::now());
    }

    /// Replies over requests, e.g. `"90.0%"`, or `"N/A"` before any traffic
    pub fn success_rate(&self) -> String {
        if self.sent_count == 0 {
            return "N/A".to_string();
        }
        format!(
            "{:.1}%",
            self.received_count as f64 / self.sent_count as f64 * 100.0
        )
    }
}

/// Mutable connection bookkeeping
pub struct ConnectionState {
    machine: DynamicConnectionMachine<()>,
    pub reconnect_attempts: u32,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metrics: KeepAliveMetrics,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            machine: ConnectionMachine::new(()).into_dynamic(),
            reconnect_attempts: 0,
            last_message_time: None,
            last_error: None,
            metrics: KeepAliveMetrics::default(),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_machine(self.machine.current_state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn fire(&mut self, event: ConnectionMachineEvent) -> bool {
        match self.machine.handle(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(state = %self.state(), "Ignoring connection transition: {:?}", e);
                false
            }
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of one connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub machine_id: String,
    pub state: LinkState,
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metrics: KeepAliveMetrics,
    pub success_rate: String,
}

/// Everything the watcher keeps for one machine
pub struct Connection {
    machine_id: String,
    state: Mutex<ConnectionState>,
    channel: Mutex<Option<Arc<Dispatcher>>>,
    /// Serializes connect attempts for this machine
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    retired: AtomicBool,
}

impl Connection {
    pub fn new(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            state: Mutex::new(ConnectionState::new()),
            channel: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            heartbeat: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().metrics.consecutive_failures
    }

    pub fn metrics(&self) -> KeepAliveMetrics {
        self.state.lock().metrics.clone()
    }

    /// The open channel, if it is still usable
    pub fn live_channel(&self) -> Option<Arc<Dispatcher>> {
        self.channel
            .lock()
            .as_ref()
            .filter(|d| !d.is_closed())
            .cloned()
    }

    /// Move towards an attempt: Disconnected goes to Connecting, a Connected
    /// link whose channel died goes to Reconnecting
    pub fn begin_attempt(&self) {
        let mut state = self.state.lock();
        match state.state() {
            LinkState::Disconnected => {
                state.fire(ConnectionMachineEvent::Connect);
            }
            LinkState::Connected => {
                state.fire(ConnectionMachineEvent::Degrade);
            }
            LinkState::Connecting | LinkState::Reconnecting => {}
        }
    }

    /// Install a freshly opened channel and mark the link connected
    pub fn established(&self, dispatcher: Dispatcher) -> Arc<Dispatcher> {
        let dispatcher = Arc::new(dispatcher);
        if let Some(old) = self.channel.lock().replace(dispatcher.clone()) {
            old.close();
        }
        let mut state = self.state.lock();
        state.fire(ConnectionMachineEvent::Established);
        state.reconnect_attempts = 0;
        state.metrics.consecutive_failures = 0;
        state.last_error = None;
        state.last_message_time = Some(Utc::now());
        dispatcher
    }

    /// Record a failed connect attempt
    pub fn attempt_failed(&self, error: &str) {
        let mut state = self.state.lock();
        state.last_error = Some(error.to_string());
        if state.state() == LinkState::Connecting {
            state.fire(ConnectionMachineEvent::Fail);
        }
    }

    /// Drop the channel and enter Reconnecting
    pub fn degrade(&self) {
        self.drop_channel();
        self.state.lock().fire(ConnectionMachineEvent::Degrade);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    /// Count the next reconnect attempt and return its number
    pub fn next_reconnect_attempt(&self) -> u32 {
        let mut state = self.state.lock();
        state.reconnect_attempts += 1;
        state.reconnect_attempts
    }

    /// Stop reconnecting; the link stays Disconnected until used again
    pub fn abandon(&self) {
        self.drop_channel();
        self.state.lock().fire(ConnectionMachineEvent::Abandon);
    }

    pub fn record_sent(&self) {
        self.state.lock().metrics.record_sent();
    }

    pub fn record_reply(&self, rtt: Duration) {
        let mut state = self.state.lock();
        state.metrics.record_reply(rtt);
        state.last_message_time = Some(Utc::now());
    }

    /// Record a failed round-trip and return the consecutive failure count
    pub fn record_failure(&self, error: &str) -> u32 {
        let mut state = self.state.lock();
        state.metrics.record_failure();
        state.last_error = Some(error.to_string());
        state.metrics.consecutive_failures
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await
    }

    /// Whether a heartbeat task is still alive for this link
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn set_heartbeat(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.heartbeat.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Tear everything down; the entry must not be used afterwards
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        self.drop_channel();
        self.state.lock().fire(ConnectionMachineEvent::Close);
    }

    fn drop_channel(&self) {
        if let Some(dispatcher) = self.channel.lock().take() {
            dispatcher.close();
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock();
        ConnectionSnapshot {
            machine_id: self.machine_id.clone(),
            state: state.state(),
            is_connected: state.is_connected(),
            reconnect_attempts: state.reconnect_attempts,
            last_message_time: state.last_message_time,
            last_error: state.last_error.clone(),
            metrics: state.metrics.clone(),
            success_rate: state.metrics.success_rate(),
        }
    }
}
