//! Single-flight periodic jobs
//!
//! Each job ticks on a fixed interval. A tick that arrives while the
//! previous run is still going is skipped, never queued.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self) -> Result<()>;
}

/// Admits one run at a time
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

/// An admitted run; the gate reopens when dropped
pub struct Flight {
    gate: Arc<SingleFlight>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a run, or `None` if one is already in progress
    pub fn try_begin(self: &Arc<Self>) -> Option<Flight> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Flight { gate: self.clone() })
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

/// Run `job` every `every` until `shutdown` flips to true
///
/// Runs are spawned so the ticker keeps its cadence; overlapping ticks are
/// skipped.
pub fn spawn(job: Arc<dyn Job>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let gate = Arc::new(SingleFlight::new());
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(flight) = gate.try_begin() else {
                debug!(job = job.name(), "Previous run still in progress, skipping tick");
                continue;
            };
            let job = job.clone();
            tokio::spawn(async move {
                let _flight = flight;
                if let Err(e) = job.tick().await {
                    warn!(job = job.name(), error = %e, "Periodic run failed");
                }
            });
        }
        debug!(job = job.name(), "Periodic job stopped");
    })
}
