//! Health check task definitions
//!
//! A task is one scheduled probe against one machine. The store persists it;
//! the quartermaster drives it through its lifecycle.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of probe a task runs inside the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckType {
    /// Every check at once, producing a complete snapshot
    OverallStatus,
    DiskSpace,
    ResourceOptimization,
    WindowsUpdates,
    WindowsDefender,
    ApplicationInventory,
    /// Free-form probe, payload and result are passed through untouched
    Custom,
}

impl CheckType {
    pub const ALL: [CheckType; 7] = [
        CheckType::OverallStatus,
        CheckType::DiskSpace,
        CheckType::ResourceOptimization,
        CheckType::WindowsUpdates,
        CheckType::WindowsDefender,
        CheckType::ApplicationInventory,
        CheckType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::OverallStatus => "OVERALL_STATUS",
            CheckType::DiskSpace => "DISK_SPACE",
            CheckType::ResourceOptimization => "RESOURCE_OPTIMIZATION",
            CheckType::WindowsUpdates => "WINDOWS_UPDATES",
            CheckType::WindowsDefender => "WINDOWS_DEFENDER",
            CheckType::ApplicationInventory => "APPLICATION_INVENTORY",
            CheckType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = String;

    /// Accepts `DISK_SPACE`, `disk_space` and `disk-space`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        CheckType::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown check type '{}'", s))
    }
}

/// Task priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
            Priority::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RetryScheduled,
}

impl TaskStatus {
    /// Completed and failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses that take part in enqueue deduplication
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::RetryScheduled)
    }

    /// Allowed lifecycle edges
    ///
    /// `Running -> Pending` only exists to hand back a task that was claimed
    /// but never executed (orphaned by a crash, or its claim was not persisted).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::RetryScheduled, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::RetryScheduled)
                | (TaskStatus::Running, TaskStatus::Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::RetryScheduled => write!(f, "RETRY_SCHEDULED"),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// One scheduled unit of probe work against a machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckTask {
    pub id: String,
    /// Creation order, assigned by the logbook on insert
    #[serde(default)]
    pub sequence: u64,
    pub machine_id: String,
    pub check_type: CheckType,
    pub priority: Priority,
    pub status: TaskStatus,
    /// Probe input forwarded to the guest agent
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Earliest time the task may run
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl HealthCheckTask {
    /// Create a pending task eligible immediately
    pub fn new(
        machine_id: &str,
        check_type: CheckType,
        priority: Priority,
        payload: Option<Value>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            sequence: 0,
            machine_id: machine_id.to_string(),
            check_type,
            priority,
            status: TaskStatus::Pending,
            payload,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            scheduled_for: now,
            created_at: now,
            executed_at: None,
            completed_at: None,
            execution_time_ms: None,
            error: None,
            result: None,
        }
    }

    /// Whether the task may be picked at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => true,
            TaskStatus::RetryScheduled => self.scheduled_for <= now,
            _ => false,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Claim the task for execution
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.executed_at = Some(now);
        Ok(())
    }

    /// Hand a claimed task back to the pool without counting an attempt
    pub fn release(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)
    }

    /// Record a successful execution
    pub fn mark_completed(
        &mut self,
        result: Value,
        execution_time_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.execution_time_ms = Some(execution_time_ms);
        self.completed_at = Some(now);
        self.error = None;
        Ok(())
    }

    /// Record a failed execution
    ///
    /// Counts the attempt, then either schedules a retry at `retry_at` or,
    /// when the attempt budget is spent, fails the task for good.
    pub fn mark_attempt_failed(
        &mut self,
        error: String,
        execution_time_ms: u64,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        let attempts = (self.attempts + 1).min(self.max_attempts);
        let next = if attempts < self.max_attempts {
            TaskStatus::RetryScheduled
        } else {
            TaskStatus::Failed
        };
        self.transition(next)?;
        self.attempts = attempts;
        self.error = Some(error);
        self.execution_time_ms = Some(execution_time_ms);
        match next {
            TaskStatus::RetryScheduled => self.scheduled_for = retry_at,
            _ => self.completed_at = Some(now),
        }
        Ok(next)
    }
}

/// Order in which eligible tasks of one machine are picked
///
/// Higher priority first, then earlier `scheduled_for`, then creation order.
pub fn selection_order(a: &HealthCheckTask, b: &HealthCheckTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.scheduled_for.cmp(&b.scheduled_for))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Pick the next task to run among one machine's tasks
pub fn pick_next(tasks: &[HealthCheckTask], now: DateTime<Utc>) -> Option<&HealthCheckTask> {
    tasks
        .iter()
        .filter(|t| t.is_eligible(now))
        .min_by(|a, b| selection_order(a, b))
}
