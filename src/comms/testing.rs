//! Scripted guest agent for tests
//!
//! [`FakeConnector`] hands out in-memory duplex streams whose far end is
//! served by a small agent task. The agent's behaviour can be switched at any
//! time; every request it receives is recorded.

use crate::comms::dispatch::{Action, Request};
use crate::comms::transport::{Connector, EndpointProbe, GuestChannel};
use crate::error::{Error, Result};
use crate::sickbay::CheckType;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Answers everything with canned healthy data
    Healthy,
    /// Reads requests, never answers
    Silent,
    /// Answers every request with `ok: false`
    Failing,
    /// Answers with the request id but an unreadable body
    Garbage,
}

type Recorded = Arc<Mutex<Vec<(String, Request)>>>;

pub struct FakeConnector {
    mode: Arc<Mutex<AgentMode>>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
    requests: Recorded,
    reports: Arc<Mutex<HashMap<CheckType, Value>>>,
    agents: Mutex<Vec<JoinHandle<()>>>,
}

impl FakeConnector {
    pub fn new(mode: AgentMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
            reports: Arc::new(Mutex::new(HashMap::new())),
            agents: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: AgentMode) {
        *self.mode.lock() = mode;
    }

    /// Make every following connect attempt fail
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn requests_for(&self, machine_id: &str) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == machine_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Override the canned answer for one check type
    pub fn set_report(&self, check: CheckType, report: Value) {
        self.reports.lock().insert(check, report);
    }

    /// Hang up every open channel
    pub fn sever(&self) {
        for agent in self.agents.lock().drain(..) {
            agent.abort();
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, machine_id: &str) -> Result<GuestChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Connection {
                machine: machine_id.to_string(),
                message: "connection refused".into(),
            });
        }

        let (near, far) = duplex(64 * 1024);
        let agent = tokio::spawn(serve(
            machine_id.to_string(),
            far,
            self.mode.clone(),
            self.requests.clone(),
            self.reports.clone(),
        ));
        self.agents.lock().push(agent);

        let (reader, writer) = tokio::io::split(near);
        Ok(GuestChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            endpoint: format!("fake://{}", machine_id),
        })
    }

    async fn probe_endpoint(&self, machine_id: &str) -> EndpointProbe {
        EndpointProbe {
            endpoint: format!("fake://{}", machine_id),
            present: !self.refuse.load(Ordering::SeqCst),
            detail: None,
        }
    }
}

async fn serve(
    machine_id: String,
    stream: DuplexStream,
    mode: Arc<Mutex<AgentMode>>,
    requests: Recorded,
    reports: Arc<Mutex<HashMap<CheckType, Value>>>,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Request>(&line) else {
            continue;
        };
        requests.lock().push((machine_id.clone(), request.clone()));

        let mode = *mode.lock();
        let frame = match mode {
            AgentMode::Silent => continue,
            AgentMode::Garbage => json!({"id": request.id, "ok": "yes"}).to_string(),
            AgentMode::Failing => {
                json!({"id": request.id, "ok": false, "error": "agent failure"}).to_string()
            }
            AgentMode::Healthy => {
                let result = answer(&request.command, &reports.lock());
                json!({"id": request.id, "ok": true, "result": result}).to_string()
            }
        };
        if write
            .write_all(format!("{}\n", frame).as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
}

fn answer(action: &Action, reports: &HashMap<CheckType, Value>) -> Value {
    match action {
        Action::Ping => json!({"pong": true}),
        Action::Introspect => json!({"service": "running", "version": "1.4.2"}),
        Action::HealthCheck { check, payload } => reports
            .get(check)
            .cloned()
            .unwrap_or_else(|| healthy_report(*check, payload.as_ref())),
    }
}

/// A healthy answer for each check type
pub fn healthy_report(check: CheckType, payload: Option<&Value>) -> Value {
    let disk = json!({"drives": [{"mount": "C:", "total_gb": 256.0, "used_gb": 96.0}]});
    let resources = json!({"cpu_percent": 12.5, "memory_percent": 41.0, "recommendations": []});
    let updates = json!({"pending": 0, "critical": 0, "reboot_required": false});
    let defender = json!({
        "enabled": true,
        "real_time_protection": true,
        "threats_detected": 0,
        "signature_age_days": 1
    });
    let inventory = json!({"applications": [{"name": "Firefox", "version": "131.0"}]});

    match check {
        CheckType::OverallStatus => json!({
            "disk": disk,
            "resources": resources,
            "updates": updates,
            "defender": defender,
            "inventory": inventory,
            "errors": []
        }),
        CheckType::DiskSpace => disk,
        CheckType::ResourceOptimization => resources,
        CheckType::WindowsUpdates => updates,
        CheckType::WindowsDefender => defender,
        CheckType::ApplicationInventory => inventory,
        CheckType::Custom => payload.cloned().unwrap_or_else(|| json!({})),
    }
}
