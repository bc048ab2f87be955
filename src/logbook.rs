//! Logbook - durable record of tasks, snapshots and machines
//!
//! The scheduler and the periodic jobs only talk to the [`Logbook`] trait.
//! [`JsonLogbook`] keeps tasks, machines and each machine's latest snapshot
//! in one JSON document, rewritten atomically on every change. Snapshot
//! history goes to an append-only JSON lines file next to it.

use crate::error::{Error, Result};
use crate::sickbay::{HealthCheckTask, HealthSnapshot, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Status of a machine as last seen by the roll call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Running,
    Stopped,
    /// Excluded from reconciliation until an operator intervenes
    Failed,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Running => write!(f, "RUNNING"),
            MachineStatus::Stopped => write!(f, "STOPPED"),
            MachineStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    /// Identity reported by the hypervisor
    pub name: String,
    pub status: MachineStatus,
    pub updated_at: DateTime<Utc>,
}

/// Persistence boundary used by every service
#[async_trait]
pub trait Logbook: Send + Sync {
    /// Insert `task` unless an open task exists for the same machine and check type
    ///
    /// Returns the id of the inserted or already-open task. Check and insert
    /// happen under one lock.
    async fn insert_task_dedup(&self, task: HealthCheckTask) -> Result<String>;

    async fn get_task(&self, id: &str) -> Result<HealthCheckTask>;

    async fn update_task(&self, task: &HealthCheckTask) -> Result<()>;

    async fn tasks_for_machine(&self, machine_id: &str) -> Result<Vec<HealthCheckTask>>;

    async fn list_tasks(&self) -> Result<Vec<HealthCheckTask>>;

    async fn insert_snapshot(&self, snapshot: HealthSnapshot) -> Result<()>;

    async fn latest_snapshot(&self, machine_id: &str) -> Result<Option<HealthSnapshot>>;

    async fn machines(&self) -> Result<Vec<MachineRecord>>;

    async fn machine(&self, id: &str) -> Result<Option<MachineRecord>>;

    /// Create the record if missing, refresh the name otherwise; status is kept
    async fn upsert_machine(&self, id: &str, name: &str) -> Result<()>;

    async fn set_machine_status(&self, id: &str, status: MachineStatus) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogbookData {
    #[serde(default)]
    next_sequence: u64,
    #[serde(default)]
    tasks: BTreeMap<String, HealthCheckTask>,
    /// Latest snapshot by machine id
    #[serde(default)]
    latest_snapshots: BTreeMap<String, HealthSnapshot>,
    #[serde(default)]
    machines: BTreeMap<String, MachineRecord>,
}

const WRITE_ATTEMPTS: u8 = 4;

/// File-backed logbook
///
/// Mutations are applied to a copy, written out, and only then made
/// visible, so a failed write leaves both the file and memory untouched.
/// Writers queue on `writer`; readers only take `data` for the copy.
pub struct JsonLogbook {
    path: Option<PathBuf>,
    data: Mutex<LogbookData>,
    writer: tokio::sync::Mutex<()>,
    backoff: ExponentialBackoff,
}

impl JsonLogbook {
    /// Open the logbook at `path`, starting empty if the file does not exist
    pub async fn open(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let data: LogbookData = serde_json::from_str(&content)?;
                info!(
                    path = %path.display(),
                    tasks = data.tasks.len(),
                    machines = data.machines.len(),
                    "Loaded logbook"
                );
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No logbook yet, starting fresh");
                LogbookData::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            data: Mutex::new(data),
            writer: tokio::sync::Mutex::new(()),
            backoff: Self::write_backoff(),
        })
    }

    /// A logbook that never touches the filesystem
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(LogbookData::default()),
            writer: tokio::sync::Mutex::new(()),
            backoff: Self::write_backoff(),
        }
    }

    fn write_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base_delay_ms(50)
            .max_delay_ms(1000)
            .multiplier(2.0)
            .max_attempts(WRITE_ATTEMPTS)
            .jitter_factor(0.2)
    }

    /// Run `op` against `path`, retrying transient failures
    async fn retrying<F, Fut>(&self, path: &Path, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::io::Result<()>> + Send,
    {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    let delay = self
                        .backoff
                        .delay(attempt, &mut rng())
                        .map(Duration::from_millis)
                        .unwrap_or(Duration::from_secs(1));
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "Logbook write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Store(format!(
                        "failed to write {} after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    )));
                }
            }
        }
    }

    /// Apply `change` to a copy of the data, persist it, then publish it
    async fn commit<T: Send>(
        &self,
        change: impl FnOnce(&mut LogbookData) -> Result<T> + Send,
    ) -> Result<T> {
        let _writer = self.writer.lock().await;
        self.apply(change).await
    }

    /// [`Self::commit`] for callers already holding the writer lock
    async fn apply<T: Send>(
        &self,
        change: impl FnOnce(&mut LogbookData) -> Result<T> + Send,
    ) -> Result<T> {
        let mut next = self.data.lock().clone();
        let value = change(&mut next)?;
        if let Some(path) = &self.path {
            let content = serde_json::to_string_pretty(&next)?;
            let content = content.as_str();
            self.retrying(path, move || write_atomic(path, content))
                .await?;
        }
        *self.data.lock() = next;
        Ok(value)
    }
}

/// Where snapshot history of the logbook at `path` is appended
fn history_path(path: &Path) -> PathBuf {
    path.with_extension("snapshots.jsonl")
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl Logbook for JsonLogbook {
    async fn insert_task_dedup(&self, mut task: HealthCheckTask) -> Result<String> {
        self.commit(move |data| {
            if let Some(open) = data.tasks.values().find(|t| {
                t.machine_id == task.machine_id
                    && t.check_type == task.check_type
                    && t.status.is_open()
            }) {
                return Ok(open.id.clone());
            }
            data.next_sequence += 1;
            task.sequence = data.next_sequence;
            let id = task.id.clone();
            data.tasks.insert(id.clone(), task);
            Ok(id)
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<HealthCheckTask> {
        let data = self.data.lock();
        data.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    async fn update_task(&self, task: &HealthCheckTask) -> Result<()> {
        let task = task.clone();
        self.commit(move |data| match data.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task;
                Ok(())
            }
            None => Err(Error::TaskNotFound(task.id)),
        })
        .await
    }

    async fn tasks_for_machine(&self, machine_id: &str) -> Result<Vec<HealthCheckTask>> {
        let data = self.data.lock();
        let mut tasks: Vec<_> = data
            .tasks
            .values()
            .filter(|t| t.machine_id == machine_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    async fn list_tasks(&self) -> Result<Vec<HealthCheckTask>> {
        let data = self.data.lock();
        let mut tasks: Vec<_> = data.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    async fn insert_snapshot(&self, snapshot: HealthSnapshot) -> Result<()> {
        let _writer = self.writer.lock().await;
        if let Some(path) = &self.path {
            let history = history_path(path);
            let line = format!("{}\n", serde_json::to_string(&snapshot)?);
            let (target, line) = (history.as_path(), line.as_str());
            self.retrying(target, move || append_line(target, line))
                .await?;
        }
        self.apply(move |data| {
            data.latest_snapshots
                .insert(snapshot.machine_id.clone(), snapshot);
            Ok(())
        })
        .await
    }

    async fn latest_snapshot(&self, machine_id: &str) -> Result<Option<HealthSnapshot>> {
        let data = self.data.lock();
        Ok(data.latest_snapshots.get(machine_id).cloned())
    }

    async fn machines(&self) -> Result<Vec<MachineRecord>> {
        let data = self.data.lock();
        Ok(data.machines.values().cloned().collect())
    }

    async fn machine(&self, id: &str) -> Result<Option<MachineRecord>> {
        let data = self.data.lock();
        Ok(data.machines.get(id).cloned())
    }

    async fn upsert_machine(&self, id: &str, name: &str) -> Result<()> {
        let (id, name) = (id.to_string(), name.to_string());
        self.commit(move |data| {
            let now = Utc::now();
            data.machines
                .entry(id.clone())
                .and_modify(|m| {
                    if m.name != name {
                        m.name = name.clone();
                        m.updated_at = now;
                    }
                })
                .or_insert_with(|| MachineRecord {
                    id,
                    name,
                    status: MachineStatus::Stopped,
                    updated_at: now,
                });
            Ok(())
        })
        .await
    }

    async fn set_machine_status(&self, id: &str, status: MachineStatus) -> Result<()> {
        let id = id.to_string();
        self.commit(move |data| match data.machines.get_mut(&id) {
            Some(machine) => {
                machine.status = status;
                machine.updated_at = Utc::now();
                Ok(())
            }
            None => Err(Error::MachineNotFound(id)),
        })
        .await
    }
}

/// Tasks stuck in RUNNING, used by startup recovery
pub async fn running_tasks(logbook: &dyn Logbook) -> Result<Vec<HealthCheckTask>> {
    Ok(logbook
        .list_tasks()
        .await?
        .into_iter()
        .filter(|t| t.status == TaskStatus::Running)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sickbay::{CheckReport, CheckType, Priority};
    use serde_json::json;
    use tempfile::TempDir;

    fn task(machine: &str, check: CheckType) -> HealthCheckTask {
        HealthCheckTask::new(machine, check, Priority::Medium, None, 3)
    }

    #[tokio::test]
    async fn test_dedup_returns_open_task() {
        let logbook = JsonLogbook::in_memory();
        let first = logbook
            .insert_task_dedup(task("vm-1", CheckType::DiskSpace))
            .await
            .unwrap();
        let second = logbook
            .insert_task_dedup(task("vm-1", CheckType::DiskSpace))
            .await
            .unwrap();
        assert_eq!(first, second);

        let other = logbook
            .insert_task_dedup(task("vm-1", CheckType::WindowsUpdates))
            .await
            .unwrap();
        assert_ne!(first, other);
        assert_eq!(logbook.list_tasks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dedup_ignores_closed_tasks() {
        let logbook = JsonLogbook::in_memory();
        let id = logbook
            .insert_task_dedup(task("vm-1", CheckType::DiskSpace))
            .await
            .unwrap();

        let mut stored = logbook.get_task(&id).await.unwrap();
        stored.mark_running(Utc::now()).unwrap();
        logbook.update_task(&stored).await.unwrap();

        let fresh = logbook
            .insert_task_dedup(task("vm-1", CheckType::DiskSpace))
            .await
            .unwrap();
        assert_ne!(id, fresh);
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let logbook = JsonLogbook::in_memory();
        for check in [CheckType::DiskSpace, CheckType::WindowsUpdates, CheckType::Custom] {
            logbook.insert_task_dedup(task("vm-1", check)).await.unwrap();
        }
        let sequences: Vec<u64> = logbook
            .tasks_for_machine("vm-1")
            .await
            .unwrap()
            .iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let logbook = JsonLogbook::in_memory();
        assert!(logbook.get_task("nope").await.unwrap_err().is_not_found());
        assert!(
            logbook
                .set_machine_status("nope", MachineStatus::Running)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(logbook.machine("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_status() {
        let logbook = JsonLogbook::in_memory();
        logbook.upsert_machine("vm-1", "win-01").await.unwrap();
        logbook
            .set_machine_status("vm-1", MachineStatus::Running)
            .await
            .unwrap();
        logbook.upsert_machine("vm-1", "win-01-renamed").await.unwrap();

        let machine = logbook.machine("vm-1").await.unwrap().unwrap();
        assert_eq!(machine.status, MachineStatus::Running);
        assert_eq!(machine.name, "win-01-renamed");
    }

    #[tokio::test]
    async fn test_latest_snapshot_per_machine() {
        let logbook = JsonLogbook::in_memory();
        let report = || CheckReport::Custom(json!({"ok": true}));
        let first = HealthSnapshot::record("vm-1", None, report(), 1);
        let other = HealthSnapshot::record("vm-2", None, report(), 1);
        let second = HealthSnapshot::record("vm-1", Some(&first), report(), 1);

        logbook.insert_snapshot(first).await.unwrap();
        logbook.insert_snapshot(second.clone()).await.unwrap();
        logbook.insert_snapshot(other).await.unwrap();

        let latest = logbook.latest_snapshot("vm-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(logbook.latest_snapshot("vm-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("logbook.json");

        let id = {
            let logbook = JsonLogbook::open(&path).await.unwrap();
            logbook.upsert_machine("vm-1", "win-01").await.unwrap();
            logbook
                .insert_task_dedup(task("vm-1", CheckType::OverallStatus))
                .await
                .unwrap()
        };

        let reopened = JsonLogbook::open(&path).await.unwrap();
        let stored = reopened.get_task(&id).await.unwrap();
        assert_eq!(stored.check_type, CheckType::OverallStatus);
        assert_eq!(stored.sequence, 1);
        assert_eq!(reopened.machines().await.unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_snapshot_history_kept_out_of_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logbook.json");
        let report = || CheckReport::Custom(json!({"ok": true}));

        let latest = {
            let logbook = JsonLogbook::open(&path).await.unwrap();
            let first = HealthSnapshot::record("vm-1", None, report(), 1);
            let second = HealthSnapshot::record("vm-1", Some(&first), report(), 1);
            let other = HealthSnapshot::record("vm-2", None, report(), 1);
            for snapshot in [first, second.clone(), other] {
                logbook.insert_snapshot(snapshot).await.unwrap();
            }
            second
        };

        let document: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["latest_snapshots"].as_object().unwrap().len(), 2);

        let history = std::fs::read_to_string(history_path(&path)).unwrap();
        assert_eq!(history.lines().count(), 3);

        let reopened = JsonLogbook::open(&path).await.unwrap();
        let stored = reopened.latest_snapshot("vm-1").await.unwrap().unwrap();
        assert_eq!(stored.id, latest.id);
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_writers() {
        let logbook = JsonLogbook::in_memory();
        logbook.upsert_machine("vm-1", "win-01").await.unwrap();

        let _stalled = logbook.writer.lock().await;
        let machines = tokio::time::timeout(Duration::from_secs(1), logbook.machines())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(machines.len(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), logbook.upsert_machine("vm-2", "win-02"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_running_tasks_filter() {
        let logbook = JsonLogbook::in_memory();
        let id = logbook
            .insert_task_dedup(task("vm-1", CheckType::DiskSpace))
            .await
            .unwrap();
        logbook
            .insert_task_dedup(task("vm-2", CheckType::DiskSpace))
            .await
            .unwrap();

        let mut stored = logbook.get_task(&id).await.unwrap();
        stored.mark_running(Utc::now()).unwrap();
        logbook.update_task(&stored).await.unwrap();

        let running = running_tasks(&logbook).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, id);
    }
}
