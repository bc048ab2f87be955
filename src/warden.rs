//! The Warden - daemon supervisor
//!
//! Builds the long-lived services from config, hands orphaned RUNNING tasks
//! back to the pool, then runs the periodic jobs until Ctrl+C or a shutdown
//! request arrives:
//! - Roll call: align machine status with the hypervisor
//! - Lookout: probe running machines with stale health data
//! - Rounds: admit the routine overall status check
//! - Queue pump: run eligible tasks

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::comms::{UnixSocketConnector, Watcher};
use crate::error::{Error, Result};
use crate::herald::{self, Event, Herald};
use crate::hypervisor::{CommandHypervisor, Hypervisor};
use crate::logbook::{JsonLogbook, Logbook};
use crate::lookout::Lookout;
use crate::manifest::WatchkeeperConfig;
use crate::periodic::{self, Job};
use crate::quartermaster::Quartermaster;
use crate::roll_call::RollCall;
use crate::rounds::{QueuePump, Rounds};

/// How long the event consumer gets to drain after the jobs stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Long-lived services shared by the daemon and the one-shot commands
pub struct Services {
    pub config: WatchkeeperConfig,
    pub logbook: Arc<dyn Logbook>,
    pub watcher: Arc<Watcher>,
    pub herald: Herald,
    pub quartermaster: Arc<Quartermaster>,
    pub hypervisor: Arc<dyn Hypervisor>,
}

impl Services {
    /// Open the logbook, seed configured machines and wire the services
    pub async fn build(config: WatchkeeperConfig) -> Result<(Self, mpsc::Receiver<Event>)> {
        tokio::fs::create_dir_all(&config.config.data_dir).await?;
        let logbook: Arc<dyn Logbook> = Arc::new(JsonLogbook::open(&config.logbook_path()).await?);
        for machine in &config.machines {
            logbook.upsert_machine(&machine.id, &machine.name).await?;
        }

        let connector = Arc::new(UnixSocketConnector::from_config(&config));
        let watcher = Arc::new(Watcher::new(connector, config.heartbeat.clone()));
        let (herald, events) = Herald::channel();
        let quartermaster = Arc::new(Quartermaster::new(
            logbook.clone(),
            watcher.clone(),
            herald.clone(),
            config.queue.clone(),
            &config.retry,
        ));
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(CommandHypervisor::from_config(&config.hypervisor)?);

        Ok((
            Self {
                config,
                logbook,
                watcher,
                herald,
                quartermaster,
                hypervisor,
            },
            events,
        ))
    }

    fn jobs(&self) -> Vec<(Arc<dyn Job>, Duration)> {
        let roll_call = RollCall::new(
            self.logbook.clone(),
            self.hypervisor.clone(),
            self.quartermaster.clone(),
            self.watcher.clone(),
            self.herald.clone(),
        );
        let lookout = Lookout::new(
            self.logbook.clone(),
            self.watcher.clone(),
            self.config.lookout.clone(),
        );
        let rounds = Rounds::new(self.logbook.clone(), self.quartermaster.clone());
        let pump = QueuePump::new(self.logbook.clone(), self.quartermaster.clone());

        vec![
            (
                Arc::new(roll_call) as Arc<dyn Job>,
                Duration::from_secs(self.config.roll_call.interval_secs),
            ),
            (
                Arc::new(lookout),
                Duration::from_secs(self.config.lookout.interval_secs),
            ),
            (
                Arc::new(rounds),
                Duration::from_secs(self.config.rounds.interval_secs),
            ),
            (
                Arc::new(pump),
                Duration::from_secs(self.config.rounds.pump_interval_secs),
            ),
        ]
    }
}

/// Events the Warden receives
#[derive(Debug)]
pub enum WardenEvent {
    /// Stop the jobs and close every guest connection
    Shutdown,
}

pub struct Warden {
    services: Services,
    events: mpsc::Receiver<Event>,
    rx: mpsc::Receiver<WardenEvent>,
    tx: mpsc::Sender<WardenEvent>,
}

impl Warden {
    pub fn new(services: Services, events: mpsc::Receiver<Event>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            services,
            events,
            rx,
            tx,
        }
    }

    pub fn handle(&self) -> WardenHandle {
        WardenHandle {
            sender: self.tx.clone(),
        }
    }

    /// Run until Ctrl+C or [`WardenHandle::request_shutdown`]
    pub async fn run(self) -> Result<()> {
        let Warden {
            services,
            events,
            mut rx,
            tx: _tx,
        } = self;

        let recovered = services.quartermaster.recover_interrupted().await?;
        if recovered > 0 {
            warn!(tasks = recovered, "Interrupted tasks returned to the queue");
        }

        let consumer = tokio::spawn(herald::run_consumer(
            events,
            services.config.config.events_file.clone(),
        ));

        let (stop, shutdown) = watch::channel(false);
        let jobs: Vec<(&'static str, JoinHandle<()>)> = services
            .jobs()
            .into_iter()
            .map(|(job, every)| {
                info!(job = job.name(), every_secs = every.as_secs(), "Starting periodic job");
                (job.name(), periodic::spawn(job, every, shutdown.clone()))
            })
            .collect();
        drop(shutdown);

        info!(machines = services.config.machines.len(), "Watchkeeper running");

        tokio::select! {
            event = rx.recv() => match event {
                Some(WardenEvent::Shutdown) | None => info!("Shutdown requested"),
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Cannot listen for Ctrl+C, shutting down");
                } else {
                    info!("Ctrl+C received");
                }
            }
        }

        let _ = stop.send(true);
        for (name, handle) in jobs {
            if let Err(e) = handle.await {
                warn!(job = name, error = %e, "Periodic job ended abnormally");
            }
        }
        services.watcher.shutdown();

        // runs still in flight hold heralds; don't wait on them forever
        drop(services);
        if tokio::time::timeout(DRAIN_TIMEOUT, consumer).await.is_err() {
            warn!("Event consumer did not drain in time");
        }

        info!("Watchkeeper stopped");
        Ok(())
    }
}

/// Handle for asking a running Warden to stop
#[derive(Clone)]
pub struct WardenHandle {
    sender: mpsc::Sender<WardenEvent>,
}

impl WardenHandle {
    pub async fn request_shutdown(&self) -> Result<()> {
        self.sender
            .send(WardenEvent::Shutdown)
            .await
            .map_err(|_| Error::Io(std::io::Error::other("Warden channel closed")))
    }
}
