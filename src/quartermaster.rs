//! The Quartermaster - health check task scheduler
//!
//! Admits tasks into the logbook, picks the next eligible one per machine,
//! runs it through the watcher and records the outcome. Failed attempts are
//! rescheduled with exponential backoff until the attempt budget is spent.
//!
//! At most one task per machine is RUNNING at any time: an in-process
//! machine lock is taken before the RUNNING transition, and a persisted
//! RUNNING row (e.g. from another process) also blocks selection.

use crate::comms::{Action, Watcher};
use crate::error::{Error, Result};
use crate::herald::{self, Herald};
use crate::logbook::{self, Logbook};
use crate::manifest::{QueueConfig, RetryConfig};
use crate::sickbay::check::pick_next;
use crate::sickbay::{
    CheckReport, CheckType, HealthCheckTask, HealthLevel, HealthSnapshot, Priority, TaskStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use parking_lot::Mutex;
use rand::rng;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Delay before the next attempt of a failed task
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new()
                .base_delay_ms(config.base_delay_ms)
                .max_delay_ms(config.max_delay_ms)
                .multiplier(config.multiplier)
                .max_attempts(u8::MAX)
                .jitter_factor(config.jitter_factor),
            cap: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the `attempts`-th failure, never above the cap
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let attempt = attempts.clamp(1, u8::MAX as u32) as u8;
        self.backoff
            .delay(attempt, &mut rng())
            .map(Duration::from_millis)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// What one `process_queue` call did
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        task_id: String,
        check: CheckType,
        overall_status: HealthLevel,
        snapshot_id: String,
        execution_time_ms: u64,
    },
    RetryScheduled {
        task_id: String,
        check: CheckType,
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        task_id: String,
        check: CheckType,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub total: usize,
    /// Tasks created since 00:00 UTC today
    pub created_today: usize,
}

type BusySet = Arc<Mutex<HashSet<String>>>;

/// Holds a machine's slot until dropped
struct MachineGuard {
    busy: BusySet,
    machine_id: String,
}

impl MachineGuard {
    fn acquire(busy: &BusySet, machine_id: &str) -> Option<Self> {
        if !busy.lock().insert(machine_id.to_string()) {
            return None;
        }
        Some(Self {
            busy: busy.clone(),
            machine_id: machine_id.to_string(),
        })
    }
}

impl Drop for MachineGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.machine_id);
    }
}

pub struct Quartermaster {
    logbook: Arc<dyn Logbook>,
    watcher: Arc<Watcher>,
    herald: Herald,
    retry: RetryPolicy,
    queue: QueueConfig,
    busy: BusySet,
    /// Outcomes whose write failed, by machine; written before the machine runs again
    unrecorded: Mutex<HashMap<String, HealthCheckTask>>,
}

impl Quartermaster {
    pub fn new(
        logbook: Arc<dyn Logbook>,
        watcher: Arc<Watcher>,
        herald: Herald,
        queue: QueueConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            logbook,
            watcher,
            herald,
            retry: RetryPolicy::from_config(retry),
            queue,
            busy: Arc::new(Mutex::new(HashSet::new())),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a health check, or return the id of the identical open one
    pub async fn enqueue(
        &self,
        machine_id: &str,
        check: CheckType,
        priority: Priority,
        payload: Option<Value>,
    ) -> Result<String> {
        self.require_machine(machine_id).await?;

        let task = HealthCheckTask::new(machine_id, check, priority, payload, self.queue.max_attempts);
        let candidate = task.id.clone();
        let id = self.logbook.insert_task_dedup(task).await?;
        if id == candidate {
            info!(machine = %machine_id, task = %id, check = %check, priority = %priority, "Task queued");
        } else {
            debug!(machine = %machine_id, task = %id, check = %check, "Identical task already queued");
        }
        Ok(id)
    }

    /// Whether `machine_id` has a task that could run now
    pub async fn has_eligible_task(&self, machine_id: &str) -> Result<bool> {
        if self.unrecorded.lock().contains_key(machine_id) {
            return Ok(true);
        }
        let tasks = self.logbook.tasks_for_machine(machine_id).await?;
        Ok(pick_next(&tasks, Utc::now()).is_some())
    }

    /// Run the next eligible task of `machine_id`
    ///
    /// Returns `None` when nothing is eligible or the machine is busy.
    pub async fn process_queue(&self, machine_id: &str) -> Result<Option<TaskOutcome>> {
        self.require_machine(machine_id).await?;

        let Some(_guard) = MachineGuard::acquire(&self.busy, machine_id) else {
            debug!(machine = %machine_id, "{}", Error::MachineBusy(machine_id.to_string()));
            return Ok(None);
        };
        self.record_pending_outcome(machine_id).await?;

        let tasks = self.logbook.tasks_for_machine(machine_id).await?;
        if let Some(running) = tasks.iter().find(|t| t.status == TaskStatus::Running) {
            debug!(machine = %machine_id, task = %running.id, "Task already running");
            return Ok(None);
        }

        let now = Utc::now();
        let Some(next) = pick_next(&tasks, now) else {
            return Ok(None);
        };
        let mut task = next.clone();
        task.mark_running(now)?;
        if let Err(e) = self.logbook.update_task(&task).await {
            error!(task = %task.id, machine = %machine_id, error = %e, "Could not claim task");
            return Err(e);
        }
        info!(task = %task.id, machine = %machine_id, check = %task.check_type, "Running health check");

        let started = Instant::now();
        let result = self.execute(&task).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(report) => self.complete(task, report, elapsed).await?,
            Err(e) if e.is_transient() => self.fail_attempt(task, e, elapsed).await?,
            Err(e) => {
                // not the guest's fault: hand the task back untouched
                task.release()?;
                self.store_outcome(&task).await?;
                return Err(e);
            }
        };
        Ok(Some(outcome))
    }

    async fn execute(&self, task: &HealthCheckTask) -> Result<CheckReport> {
        let action = Action::HealthCheck {
            check: task.check_type,
            payload: task.payload.clone(),
        };
        let reply = self
            .watcher
            .send_safe_command(&task.machine_id, action, self.queue.command_timeout())
            .await?;
        CheckReport::decode(task.check_type, reply).map_err(|e| Error::Protocol {
            machine: task.machine_id.clone(),
            message: format!("malformed {} report: {}", task.check_type, e),
        })
    }

    async fn complete(
        &self,
        mut task: HealthCheckTask,
        report: CheckReport,
        elapsed: u64,
    ) -> Result<TaskOutcome> {
        let previous = match self.logbook.latest_snapshot(&task.machine_id).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(machine = %task.machine_id, error = %e, "Previous snapshot unavailable");
                None
            }
        };
        let snapshot = HealthSnapshot::record(&task.machine_id, previous.as_ref(), report.clone(), elapsed);

        // a completed task always has its snapshot
        if let Err(e) = self.logbook.insert_snapshot(snapshot.clone()).await {
            error!(task = %task.id, machine = %task.machine_id, error = %e, "Could not store snapshot, handing task back");
            task.release()?;
            self.store_outcome(&task).await?;
            return Err(e);
        }
        task.mark_completed(report.to_value(), elapsed, Utc::now())?;
        self.store_outcome(&task).await?;

        info!(
            task = %task.id,
            machine = %task.machine_id,
            check = %task.check_type,
            status = %snapshot.overall_status,
            elapsed_ms = elapsed,
            "Health check completed"
        );
        self.herald.publish(
            herald::TASK_COMPLETED,
            json!({
                "task_id": task.id,
                "machine_id": task.machine_id,
                "check_type": task.check_type,
                "overall_status": snapshot.overall_status,
                "snapshot_id": snapshot.id,
                "execution_time_ms": elapsed,
            }),
        );

        Ok(TaskOutcome::Completed {
            task_id: task.id,
            check: task.check_type,
            overall_status: snapshot.overall_status,
            snapshot_id: snapshot.id,
            execution_time_ms: elapsed,
        })
    }

    async fn fail_attempt(
        &self,
        mut task: HealthCheckTask,
        cause: Error,
        elapsed: u64,
    ) -> Result<TaskOutcome> {
        // measured from the failure, not from executed_at
        let now = Utc::now();
        let delay = self.retry.delay_for(task.attempts + 1);
        let retry_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let status = task.mark_attempt_failed(cause.to_string(), elapsed, retry_at, now)?;
        self.store_outcome(&task).await?;

        if status == TaskStatus::RetryScheduled {
            warn!(
                task = %task.id,
                machine = %task.machine_id,
                check = %task.check_type,
                attempt = task.attempts,
                error = %cause,
                "Health check failed, retrying in {:?}",
                delay
            );
            return Ok(TaskOutcome::RetryScheduled {
                task_id: task.id,
                check: task.check_type,
                attempts: task.attempts,
                retry_at,
                error: cause.to_string(),
            });
        }

        let exhausted = Error::RetryExhausted {
            task: task.id.clone(),
            attempts: task.attempts,
            last_error: cause.to_string(),
        };
        error!(machine = %task.machine_id, check = %task.check_type, "{}", exhausted);
        self.herald.publish(
            herald::TASK_FAILED,
            json!({
                "task_id": task.id,
                "machine_id": task.machine_id,
                "check_type": task.check_type,
                "attempts": task.attempts,
                "error": exhausted.to_string(),
            }),
        );

        Ok(TaskOutcome::Failed {
            task_id: task.id,
            check: task.check_type,
            attempts: task.attempts,
            error: exhausted.to_string(),
        })
    }

    /// Write the task leaving RUNNING, keeping it for a later write on failure
    async fn store_outcome(&self, task: &HealthCheckTask) -> Result<()> {
        if let Err(e) = self.logbook.update_task(task).await {
            error!(
                task = %task.id,
                machine = %task.machine_id,
                status = %task.status,
                error = %e,
                "Could not record outcome, retrying on the machine's next run"
            );
            self.unrecorded
                .lock()
                .insert(task.machine_id.clone(), task.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Write an outcome an earlier run could not store
    async fn record_pending_outcome(&self, machine_id: &str) -> Result<()> {
        let pending = self.unrecorded.lock().remove(machine_id);
        let Some(task) = pending else {
            return Ok(());
        };
        if let Err(e) = self.logbook.update_task(&task).await {
            warn!(task = %task.id, machine = %machine_id, error = %e, "Outcome still cannot be recorded");
            self.unrecorded.lock().insert(machine_id.to_string(), task);
            return Err(e);
        }
        info!(task = %task.id, machine = %machine_id, status = %task.status, "Recorded outcome of an earlier run");
        Ok(())
    }

    /// Task counts by status
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let tasks = self.logbook.list_tasks().await?;
        let midnight = Utc.from_utc_datetime(&Utc::now().date_naive().and_time(chrono::NaiveTime::MIN));

        let mut stats = QueueStats {
            total: tasks.len(),
            ..QueueStats::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::RetryScheduled => stats.retry_scheduled += 1,
            }
            if task.created_at >= midnight {
                stats.created_today += 1;
            }
        }
        Ok(stats)
    }

    /// Hand tasks orphaned in RUNNING by a previous process back to the pool
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut task in logbook::running_tasks(self.logbook.as_ref()).await? {
            task.release()?;
            self.logbook.update_task(&task).await?;
            warn!(task = %task.id, machine = %task.machine_id, "Recovered interrupted task");
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn require_machine(&self, machine_id: &str) -> Result<()> {
        match self.logbook.machine(machine_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::MachineNotFound(machine_id.to_string())),
        }
    }
}
