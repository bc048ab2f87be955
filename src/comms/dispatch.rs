//! Request/reply correlation over a guest channel
//!
//! Frames are single-line JSON documents. Every request carries a fresh id;
//! the reader task hands each reply to the call waiting on that id. A single
//! writer task drains an mpsc queue so frames leave in send order.

use crate::comms::transport::GuestChannel;
use crate::error::{Error, Result};
use crate::sickbay::CheckType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use uuid::Uuid;

/// What the guest agent is asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Keep-alive and liveness probe
    Ping,
    /// Describe the agent service itself
    Introspect,
    HealthCheck {
        check: CheckType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::Introspect => "introspect",
            Action::HealthCheck { .. } => "health_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub timeout_ms: u64,
    pub command: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

const OUTBOUND_QUEUE: usize = 64;

/// Counters for traffic the dispatcher could not hand to a caller
#[derive(Debug, Default)]
pub struct DispatchCounters {
    uncorrelated: AtomicU64,
    malformed: AtomicU64,
}

impl DispatchCounters {
    pub fn uncorrelated(&self) -> u64 {
        self.uncorrelated.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// One open channel to one guest agent
pub struct Dispatcher {
    machine_id: String,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    counters: Arc<DispatchCounters>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Dispatcher {
    /// Take ownership of `channel` and start its reader and writer tasks
    pub fn spawn(machine_id: &str, channel: GuestChannel) -> Self {
        let GuestChannel {
            reader, mut writer, ..
        } = channel;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(DispatchCounters::default());
        let (outbound, mut queue) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let writer = {
            let machine = machine_id.to_string();
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(mut frame) = queue.recv().await {
                    frame.push('\n');
                    let sent = match writer.write_all(frame.as_bytes()).await {
                        Ok(()) => writer.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!(machine = %machine, error = %e, "Guest channel write failed");
                        break;
                    }
                }
                shut(&machine, &closed, &pending, "channel writer stopped");
            })
        };

        let reader = {
            let machine = machine_id.to_string();
            let pending = pending.clone();
            let closed = closed.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route(&machine, &line, &pending, &counters),
                        Ok(None) => {
                            debug!(machine = %machine, "Guest channel closed by peer");
                            break;
                        }
                        Err(e) => {
                            warn!(machine = %machine, error = %e, "Guest channel read failed");
                            break;
                        }
                    }
                }
                shut(&machine, &closed, &pending, "channel closed");
            })
        };

        Self {
            machine_id: machine_id.to_string(),
            outbound,
            pending,
            closed,
            counters,
            reader,
            writer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    /// Number of calls waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `action` and wait up to `timeout` for its reply
    ///
    /// The deadline covers queueing the frame as well as the reply. Expiry
    /// removes only this call's pending entry; the channel stays up.
    pub async fn call(&self, action: Action, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        // The reader marks the channel closed before draining pending calls
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(self.connection_error("channel closed"));
        }

        let request = Request {
            id: id.clone(),
            timeout_ms: timeout.as_millis() as u64,
            command: action,
        };
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(e.into());
            }
        };
        match timeout_at(deadline, self.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                return Err(self.connection_error("channel writer stopped"));
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!(machine = %self.machine_id, "Outbound queue full until the deadline");
                return Err(self.timeout_error(timeout));
            }
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.connection_error("channel closed")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(self.timeout_error(timeout))
            }
        }
    }

    /// Stop both tasks and fail every outstanding call
    pub fn close(&self) {
        shut(&self.machine_id, &self.closed, &self.pending, "channel closed");
        self.reader.abort();
        self.writer.abort();
    }

    fn timeout_error(&self, timeout: Duration) -> Error {
        Error::Timeout {
            machine: self.machine_id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn connection_error(&self, message: &str) -> Error {
        Error::Connection {
            machine: self.machine_id.clone(),
            message: message.to_string(),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn route(machine: &str, line: &str, pending: &Pending, counters: &DispatchCounters) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(machine = %machine, error = %e, "Discarding malformed frame from guest");
            return;
        }
    };
    let Some(id) = frame.get("id").and_then(Value::as_str).map(str::to_string) else {
        counters.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(machine = %machine, "Discarding guest frame without a request id");
        return;
    };

    let Some(waiter) = pending.lock().remove(&id) else {
        counters.uncorrelated.fetch_add(1, Ordering::Relaxed);
        debug!(machine = %machine, id = %id, "Discarding reply with no outstanding call");
        return;
    };

    let outcome = match serde_json::from_value::<Reply>(frame) {
        Ok(reply) if reply.ok => Ok(reply.result.unwrap_or(Value::Null)),
        Ok(reply) => Err(Error::Guest {
            machine: machine.to_string(),
            message: reply
                .error
                .unwrap_or_else(|| "unspecified agent error".to_string()),
        }),
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(machine = %machine, id = %id, error = %e, "Unreadable reply from guest");
            Err(Error::Protocol {
                machine: machine.to_string(),
                message: format!("unreadable reply: {}", e),
            })
        }
    };
    // The caller may have timed out in the meantime
    let _ = waiter.send(outcome);
}

fn shut(machine: &str, closed: &AtomicBool, pending: &Pending, reason: &str) {
    closed.store(true, Ordering::SeqCst);
    let waiters: Vec<_> = pending.lock().drain().map(|(_, tx)| tx).collect();
    if !waiters.is_empty() {
        debug!(machine = %machine, calls = waiters.len(), "Failing outstanding calls");
    }
    for waiter in waiters {
        let _ = waiter.send(Err(Error::Connection {
            machine: machine.to_string(),
            message: reason.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    /// Channel whose far end is handed to the test as raw halves
    fn pipe() -> (
        GuestChannel,
        tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (near, far) = duplex(64 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        let channel = GuestChannel {
            reader: Box::new(near_read),
            writer: Box::new(near_write),
            endpoint: "duplex".into(),
        };
        (channel, BufReader::new(far_read).lines(), far_write)
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request {
            id: "abc".into(),
            timeout_ms: 5000,
            command: Action::HealthCheck {
                check: CheckType::DiskSpace,
                payload: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "abc",
                "timeout_ms": 5000,
                "command": {"type": "health_check", "check": "DISK_SPACE"}
            })
        );

        let ping = serde_json::to_value(Action::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));
    }

    #[tokio::test]
    async fn test_reply_correlated_by_id() {
        let (channel, mut requests, mut replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        let agent = tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();
            assert_eq!(request.command, Action::Ping);
            // noise first, then the real answer
            replies
                .write_all(b"{\"id\":\"stranger\",\"ok\":true}\n")
                .await
                .unwrap();
            let reply = json!({"id": request.id, "ok": true, "result": {"pong": true}});
            replies
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            (requests, replies)
        });

        let value = dispatcher
            .call(Action::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!({"pong": true}));
        assert_eq!(dispatcher.counters().uncorrelated(), 1);
        assert_eq!(dispatcher.in_flight(), 0);
        let _halves = agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_error_maps_to_guest() {
        let (channel, mut requests, mut replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();
            let reply = json!({"id": request.id, "ok": false, "error": "wmi unavailable"});
            replies
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            // keep the channel open
            let _ = requests.next_line().await;
        });

        let err = dispatcher
            .call(Action::Introspect, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::Guest { message, .. } => assert_eq!(message, "wmi unavailable"),
            other => panic!("expected guest error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_only_its_entry() {
        let (channel, mut requests, _replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        let err = dispatcher
            .call(Action::Ping, Duration::from_millis(5000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 5000, .. }));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(!dispatcher.is_closed());

        let line = requests.next_line().await.unwrap().unwrap();
        let request: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(request.timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_eof_fails_outstanding_calls() {
        let (channel, requests, replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        let call = dispatcher.call(Action::Ping, Duration::from_secs(30));
        let hangup = async move {
            tokio::task::yield_now().await;
            drop(requests);
            drop(replies);
        };
        let (result, ()) = tokio::join!(call, hangup);

        assert!(matches!(result, Err(Error::Connection { .. })));
        assert!(dispatcher.is_closed());
        let again = dispatcher.call(Action::Ping, Duration::from_secs(1)).await;
        assert!(matches!(again, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_malformed_frame_counted() {
        let (channel, mut requests, mut replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();
            replies.write_all(b"<<garbage>>\n").await.unwrap();
            let reply = json!({"id": request.id, "ok": true});
            replies
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            let _ = requests.next_line().await;
        });

        let value = dispatcher
            .call(Action::Ping, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(dispatcher.counters().malformed(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_reply_fails_its_call() {
        let (channel, mut requests, mut replies) = pipe();
        let dispatcher = Dispatcher::spawn("vm-1", channel);

        tokio::spawn(async move {
            let line = requests.next_line().await.unwrap().unwrap();
            let request: Request = serde_json::from_str(&line).unwrap();
            let reply = json!({"id": request.id, "ok": "yes"});
            replies
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            let _ = requests.next_line().await;
        });

        let err = dispatcher
            .call(Action::Ping, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "got {:?}", err);
        assert_eq!(dispatcher.counters().malformed(), 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_holds_when_guest_stops_reading() {
        // far end never reads, so the writer stalls and the queue fills up
        let (near, far) = duplex(16);
        let (near_read, near_write) = tokio::io::split(near);
        let channel = GuestChannel {
            reader: Box::new(near_read),
            writer: Box::new(near_write),
            endpoint: "duplex".into(),
        };
        let dispatcher = Arc::new(Dispatcher::spawn("vm-1", channel));

        let started = Instant::now();
        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..OUTBOUND_QUEUE + 4 {
            let dispatcher = dispatcher.clone();
            calls.spawn(async move {
                dispatcher
                    .call(Action::Ping, Duration::from_millis(2000))
                    .await
            });
        }
        while let Some(result) = calls.join_next().await {
            let err = result.unwrap().unwrap_err();
            assert!(matches!(err, Error::Timeout { timeout_ms: 2000, .. }));
        }
        assert!(started.elapsed() <= Duration::from_millis(2100));
        assert_eq!(dispatcher.in_flight(), 0);
        drop(far);
    }
}
