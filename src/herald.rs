//! The Herald - fire-and-forget event notifications
//!
//! Services publish events into a bounded channel and never wait on it.
//! A single consumer logs each event and optionally appends it to a JSON
//! lines file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const TASK_COMPLETED: &str = "health.task.completed";
pub const TASK_FAILED: &str = "health.task.failed";
pub const MACHINE_STATUS_CHANGED: &str = "machine.status.changed";

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Herald {
    tx: mpsc::Sender<Event>,
}

impl Herald {
    /// Create a herald and the receiving end for its consumer
    pub fn channel() -> (Self, mpsc::Receiver<Event>) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Publish without waiting; the event is dropped if the queue is full
    pub fn publish(&self, topic: &str, payload: Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            at: Utc::now(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(topic = %event.topic, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(topic = %event.topic, "No event consumer, dropping event");
            }
        }
    }
}

/// Drain events until every herald is dropped
pub async fn run_consumer(mut rx: mpsc::Receiver<Event>, events_file: Option<PathBuf>) {
    let mut sink = match &events_file {
        Some(path) => match open_sink(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open events file");
                None
            }
        },
        None => None,
    };

    while let Some(event) = rx.recv().await {
        info!(topic = %event.topic, payload = %event.payload, "Event");
        if let Some(file) = sink.as_mut() {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(topic = %event.topic, error = %e, "Cannot encode event");
                    continue;
                }
            };
            let written = match file.write_all(format!("{}\n", line).as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "Failed to append event");
            }
        }
    }
    debug!("Event consumer stopped");
}

async fn open_sink(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_publish_never_blocks() {
        let (herald, mut rx) = Herald::with_capacity(1);
        herald.publish(TASK_COMPLETED, json!({"task": "a"}));
        herald.publish(TASK_COMPLETED, json!({"task": "b"}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, json!({"task": "a"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_consumer() {
        let (herald, rx) = Herald::channel();
        drop(rx);
        herald.publish(TASK_FAILED, json!({}));
    }

    #[tokio::test]
    async fn test_consumer_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events").join("events.jsonl");
        let (herald, rx) = Herald::channel();

        herald.publish(MACHINE_STATUS_CHANGED, json!({"machine": "vm-1"}));
        herald.publish(TASK_FAILED, json!({"machine": "vm-1"}));
        drop(herald);
        run_consumer(rx, Some(path.clone())).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let topics: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["topic"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(topics, vec![MACHINE_STATUS_CHANGED, TASK_FAILED]);
    }
}
