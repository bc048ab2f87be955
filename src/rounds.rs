//! Routine rounds and the queue pump
//!
//! [`Rounds`] admits an overall status check for every running machine;
//! dedup keeps repeated rounds from piling up work. [`QueuePump`] is the
//! scheduling tick: every running machine with an eligible task gets one
//! `process_queue` call, all machines concurrently.

use crate::error::Result;
use crate::logbook::{Logbook, MachineStatus};
use crate::periodic::Job;
use crate::quartermaster::{Quartermaster, TaskOutcome};
use crate::sickbay::{CheckType, Priority};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

async fn running_machines(logbook: &dyn Logbook) -> Result<Vec<String>> {
    Ok(logbook
        .machines()
        .await?
        .into_iter()
        .filter(|m| m.status == MachineStatus::Running)
        .map(|m| m.id)
        .collect())
}

pub struct Rounds {
    logbook: Arc<dyn Logbook>,
    quartermaster: Arc<Quartermaster>,
}

impl Rounds {
    pub fn new(logbook: Arc<dyn Logbook>, quartermaster: Arc<Quartermaster>) -> Self {
        Self {
            logbook,
            quartermaster,
        }
    }

    /// Enqueue the routine check; returns the task ids (new or existing)
    pub async fn make_rounds(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for machine_id in running_machines(self.logbook.as_ref()).await? {
            match self
                .quartermaster
                .enqueue(&machine_id, CheckType::OverallStatus, Priority::Medium, None)
                .await
            {
                Ok(id) => ids.push(id),
                Err(e) => warn!(machine = %machine_id, error = %e, "Could not enqueue routine check"),
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl Job for Rounds {
    fn name(&self) -> &'static str {
        "rounds"
    }

    async fn tick(&self) -> Result<()> {
        let ids = self.make_rounds().await?;
        debug!(tasks = ids.len(), "Rounds finished");
        Ok(())
    }
}

pub struct QueuePump {
    logbook: Arc<dyn Logbook>,
    quartermaster: Arc<Quartermaster>,
}

impl QueuePump {
    pub fn new(logbook: Arc<dyn Logbook>, quartermaster: Arc<Quartermaster>) -> Self {
        Self {
            logbook,
            quartermaster,
        }
    }

    /// One scheduling tick; returns the outcomes of the tasks that ran
    pub async fn pump(&self) -> Result<Vec<TaskOutcome>> {
        let mut runs = JoinSet::new();
        for machine_id in running_machines(self.logbook.as_ref()).await? {
            match self.quartermaster.has_eligible_task(&machine_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(machine = %machine_id, error = %e, "Could not inspect queue");
                    continue;
                }
            }
            let quartermaster = self.quartermaster.clone();
            runs.spawn(async move {
                let result = quartermaster.process_queue(&machine_id).await;
                (machine_id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((_, Ok(Some(outcome)))) => outcomes.push(outcome),
                Ok((_, Ok(None))) => {}
                Ok((machine_id, Err(e))) => {
                    warn!(machine = %machine_id, error = %e, "Queue processing failed")
                }
                Err(e) => warn!(error = %e, "Queue processing task failed"),
            }
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl Job for QueuePump {
    fn name(&self) -> &'static str {
        "queue-pump"
    }

    async fn tick(&self) -> Result<()> {
        let outcomes = self.pump().await?;
        if !outcomes.is_empty() {
            debug!(ran = outcomes.len(), "Queue pump finished");
        }
        Ok(())
    }
}
