//! Configuration file parsing for Watchkeeper
//!
//! Parses `watchkeeper.toml` configuration files using serde

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<WatchkeeperConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse(content: &str) -> Result<WatchkeeperConfig> {
    let config: WatchkeeperConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct WatchkeeperConfig {
    /// Global configuration settings
    pub config: GlobalConfig,

    /// How to ask the hypervisor which machines are running
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// Keep-alive and reconnection policy for guest channels
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Health check task execution settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry/backoff configuration for failed health check tasks
    #[serde(default)]
    pub retry: RetryConfig,

    /// Fleet status reconciliation job
    #[serde(default)]
    pub roll_call: RollCallConfig,

    /// Staleness watchdog job
    #[serde(default)]
    pub lookout: LookoutConfig,

    /// Routine health check admission and queue pumping
    #[serde(default)]
    pub rounds: RoundsConfig,

    /// Managed machines
    #[serde(default)]
    pub machines: Vec<MachineDef>,
}

impl WatchkeeperConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for machine in &self.machines {
            if machine.id.trim().is_empty() {
                return Err(Error::ConfigValidation("Machine id cannot be empty".into()));
            }
            if machine.name.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Machine '{}' has an empty hypervisor name",
                    machine.id
                )));
            }
            if !ids.insert(&machine.id) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate machine id: {}",
                    machine.id
                )));
            }
            if !names.insert(&machine.name) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate machine name: {}",
                    machine.name
                )));
            }
        }

        if self.hypervisor.command.is_empty() {
            return Err(Error::ConfigValidation(
                "hypervisor.command cannot be empty".into(),
            ));
        }

        if self.heartbeat.interval_ms == 0 {
            return Err(Error::ConfigValidation(
                "heartbeat.interval_ms must be greater than zero".into(),
            ));
        }

        if self.heartbeat.failure_threshold == 0 {
            return Err(Error::ConfigValidation(
                "heartbeat.failure_threshold must be at least 1".into(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(Error::ConfigValidation(
                "queue.max_attempts must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::ConfigValidation(format!(
                "retry.jitter_factor must be between 0.0 and 1.0, got {}",
                self.retry.jitter_factor
            )));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::ConfigValidation(
                "retry.max_delay_ms must not be lower than retry.base_delay_ms".into(),
            ));
        }

        let intervals = [
            ("roll_call.interval_secs", self.roll_call.interval_secs),
            ("lookout.interval_secs", self.lookout.interval_secs),
            ("rounds.interval_secs", self.rounds.interval_secs),
            ("rounds.pump_interval_secs", self.rounds.pump_interval_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(Error::ConfigValidation(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        Ok(())
    }

    /// Get a machine definition by id or hypervisor name
    pub fn get_machine(&self, key: &str) -> Option<&MachineDef> {
        self.machines
            .iter()
            .find(|m| m.id == key)
            .or_else(|| self.machines.iter().find(|m| m.name == key))
    }

    /// Path of the JSON logbook
    pub fn logbook_path(&self) -> PathBuf {
        self.config.data_dir.join("logbook.json")
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Base data directory for Watchkeeper
    pub data_dir: PathBuf,

    /// Directory holding one guest agent socket per machine (`<id>.sock`)
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Append published events to this file as JSON lines
    pub events_file: Option<PathBuf>,
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/lib/watchkeeper/channels")
}

fn default_hypervisor_command() -> Vec<String> {
    vec![
        "virsh".into(),
        "list".into(),
        "--name".into(),
        "--state-running".into(),
    ]
}

fn default_hypervisor_timeout() -> u64 {
    10
}

/// Hypervisor query configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    /// Command printing one running machine name per line
    #[serde(default = "default_hypervisor_command")]
    pub command: Vec<String>,

    /// Timeout for the command in seconds
    #[serde(default = "default_hypervisor_timeout")]
    pub timeout_secs: u64,
}

impl HypervisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            command: default_hypervisor_command(),
            timeout_secs: default_hypervisor_timeout(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_introspect_timeout_ms() -> u64 {
    10_000
}

/// Keep-alive and reconnection policy
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats; a ping unanswered by the next tick is a failure
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failures before the channel is rebuilt
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Reconnect attempts before settling in the disconnected state
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base delay before the first reconnect attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnect attempts
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Timeout for establishing a channel
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for agent introspection probes
    #[serde(default = "default_introspect_timeout_ms")]
    pub introspect_timeout_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn introspect_timeout(&self) -> Duration {
        Duration::from_millis(self.introspect_timeout_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            failure_threshold: default_failure_threshold(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            introspect_timeout_ms: default_introspect_timeout_ms(),
        }
    }
}

fn default_task_max_attempts() -> u32 {
    3
}

fn default_command_timeout_ms() -> u64 {
    60_000
}

/// Health check task execution settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a task is marked failed
    #[serde(default = "default_task_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single health check round-trip
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl QueueConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_task_max_attempts(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    30_000
}

fn default_max_delay_ms() -> u64 {
    600_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.0
}

/// Retry/backoff configuration for failed health check tasks
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_roll_call_interval() -> u64 {
    30
}

/// Fleet status reconciliation settings
#[derive(Debug, Clone, Deserialize)]
pub struct RollCallConfig {
    #[serde(default = "default_roll_call_interval")]
    pub interval_secs: u64,
}

impl Default for RollCallConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_roll_call_interval(),
        }
    }
}

fn default_lookout_interval() -> u64 {
    300
}

fn default_freshness_secs() -> u64 {
    120
}

fn default_probe_timeout_ms() -> u64 {
    30_000
}

fn default_breaker_failure_threshold() -> usize {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    300
}

fn default_probe_capacity() -> f64 {
    20.0
}

fn default_probe_refill_rate() -> f64 {
    1.0
}

/// Staleness watchdog settings
#[derive(Debug, Clone, Deserialize)]
pub struct LookoutConfig {
    #[serde(default = "default_lookout_interval")]
    pub interval_secs: u64,

    /// A snapshot older than this marks the machine as stale
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// Timeout for each liveness probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures before probes are suspended
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: usize,

    /// How long probes stay suspended
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Probe burst size across the fleet
    #[serde(default = "default_probe_capacity")]
    pub probe_capacity: f64,

    /// Probe budget refill rate (probes per second)
    #[serde(default = "default_probe_refill_rate")]
    pub probe_refill_rate: f64,
}

impl LookoutConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

impl Default for LookoutConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_lookout_interval(),
            freshness_secs: default_freshness_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            probe_capacity: default_probe_capacity(),
            probe_refill_rate: default_probe_refill_rate(),
        }
    }
}

fn default_rounds_interval() -> u64 {
    300
}

fn default_pump_interval() -> u64 {
    10
}

/// Routine admission and queue pump settings
#[derive(Debug, Clone, Deserialize)]
pub struct RoundsConfig {
    /// How often an overall status check is enqueued for running machines
    #[serde(default = "default_rounds_interval")]
    pub interval_secs: u64,

    /// How often eligible tasks are pushed through the scheduler
    #[serde(default = "default_pump_interval")]
    pub pump_interval_secs: u64,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rounds_interval(),
            pump_interval_secs: default_pump_interval(),
        }
    }
}

/// Machine definition from config file
#[derive(Debug, Clone, Deserialize)]
pub struct MachineDef {
    /// Stable machine id
    pub id: String,

    /// Name the hypervisor knows the machine by
    pub name: String,

    /// Guest agent socket (defaults to `<socket_dir>/<id>.sock`)
    pub socket: Option<PathBuf>,
}

impl MachineDef {
    /// Resolve the guest agent socket path
    pub fn socket_path(&self, socket_dir: &Path) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| socket_dir.join(format!("{}.sock", self.id)))
    }
}
