//! Watchkeeper - health checks and guest channel watch for a VM fleet
//!
//! Schedules prioritized health checks against managed virtual machines,
//! runs them through a guest agent channel kept alive by heartbeats, and
//! records the outcome as health snapshots.

mod cli;
mod comms;
mod error;
mod herald;
mod hypervisor;
mod logbook;
mod lookout;
mod manifest;
mod periodic;
mod quartermaster;
mod roll_call;
mod rounds;
mod sickbay;
mod telemetry;
mod warden;

use cli::{Cli, Commands};
use comms::Action;
use error::Result;
use warden::{Services, Warden};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    telemetry::init(cli.verbose, cli.log_json);
    let config = manifest::load(&cli.config)?;

    if let Commands::Check = cli.command {
        println!("Configuration is valid: {}", cli.config.display());
        println!("  Data directory: {}", config.config.data_dir.display());
        println!("  Socket directory: {}", config.config.socket_dir.display());
        println!("  Machines: {}", config.machines.len());
        for machine in &config.machines {
            println!(
                "    {} ({}) -> {}",
                machine.id,
                machine.name,
                machine.socket_path(&config.config.socket_dir).display()
            );
        }
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().map_err(|e| error::Error::Io(std::io::Error::other(e)))?;

    rt.block_on(dispatch(cli.command, config))
}

/// Machine id for a command argument given as id or hypervisor name
fn resolve(services: &Services, key: &str) -> String {
    services
        .config
        .get_machine(key)
        .map(|m| m.id.clone())
        .unwrap_or_else(|| key.to_string())
}

/// Run one command against freshly built services
async fn dispatch(command: Commands, config: manifest::WatchkeeperConfig) -> Result<()> {
    let (services, events) = Services::build(config).await?;
    if let Commands::Run = command {
        return Warden::new(services, events).run().await;
    }

    let consumer = tokio::spawn(herald::run_consumer(
        events,
        services.config.config.events_file.clone(),
    ));

    match command {
        Commands::Enqueue {
            machine,
            check,
            priority,
            payload,
        } => {
            let id = services
                .quartermaster
                .enqueue(&resolve(&services, &machine), check, priority, payload)
                .await?;
            println!("{}", id);
        }
        Commands::Process { machine } => {
            match services.quartermaster.process_queue(&resolve(&services, &machine)).await? {
                Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                None => println!("Nothing to run for machine '{}'", machine),
            }
        }
        Commands::Queue { json } => {
            let stats = services.quartermaster.queue_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Pending:          {}", stats.pending);
                println!("Running:          {}", stats.running);
                println!("Retry scheduled:  {}", stats.retry_scheduled);
                println!("Completed:        {}", stats.completed);
                println!("Failed:           {}", stats.failed);
                println!("Total:            {}", stats.total);
                println!("Created today:    {}", stats.created_today);
            }
        }
        Commands::Machines { json } => {
            let mut rows = Vec::new();
            for machine in services.logbook.machines().await? {
                let snapshot = services.logbook.latest_snapshot(&machine.id).await?;
                rows.push((machine, snapshot));
            }

            if json {
                let data: Vec<_> = rows
                    .iter()
                    .map(|(machine, snapshot)| {
                        serde_json::json!({
                            "machine": machine,
                            "latest_snapshot": snapshot,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else if rows.is_empty() {
                println!("No machines configured.");
            } else {
                println!(
                    "{:<16} {:<20} {:<8} {:<8} {}",
                    "ID", "NAME", "STATUS", "HEALTH", "LAST CHECK"
                );
                for (machine, snapshot) in &rows {
                    let (health, at) = match snapshot {
                        Some(s) => (
                            s.overall_status.to_string(),
                            s.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        ),
                        None => ("-".to_string(), "never".to_string()),
                    };
                    println!(
                        "{:<16} {:<20} {:<8} {:<8} {}",
                        machine.id,
                        machine.name,
                        machine.status.to_string(),
                        health,
                        at
                    );
                }
            }
        }
        Commands::Connections { machines, json } => {
            let targets: Vec<String> = if machines.is_empty() {
                services
                    .logbook
                    .machines()
                    .await?
                    .into_iter()
                    .map(|m| m.id)
                    .collect()
            } else {
                machines.iter().map(|m| resolve(&services, m)).collect()
            };
            let timeout = services.config.heartbeat.interval();
            for id in &targets {
                if let Err(e) = services
                    .watcher
                    .send_safe_command(id, Action::Ping, timeout)
                    .await
                {
                    eprintln!("Warning: {} did not answer: {}", id, e);
                }
            }

            let stats = services.watcher.connection_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "Connections: {} total, {} active",
                    stats.total_connections, stats.active_connections
                );
                for conn in &stats.connections {
                    println!(
                        "  {:<16} {:<13} rtt {:>7.1}ms  success {:>6}  failures {}",
                        conn.machine_id,
                        conn.state.to_string(),
                        conn.metrics.average_rtt_ms,
                        conn.success_rate,
                        conn.metrics.consecutive_failures
                    );
                }
            }
        }
        Commands::Diagnose { machine } => {
            let diagnosis = services
                .watcher
                .diagnose_socket_issues(&resolve(&services, &machine))
                .await;
            println!("Diagnostics for {}:", diagnosis.machine_id);
            for line in &diagnosis.diagnostics {
                println!("  - {}", line);
            }
            if !diagnosis.recommendations.is_empty() {
                println!("Recommendations:");
                for line in &diagnosis.recommendations {
                    println!("  - {}", line);
                }
            }
        }
        Commands::Agent { machine, json } => {
            let status = services
                .watcher
                .check_agent_service(&resolve(&services, &machine))
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Installed: {}", status.installed);
                println!("Running:   {}", status.running);
                if let Some(version) = &status.version {
                    println!("Version:   {}", version);
                }
                if let Some(err) = &status.error {
                    println!("Error:     {}", err);
                }
            }
        }
        // Already handled above
        Commands::Run | Commands::Check | Commands::Completion { .. } => unreachable!(),
    }

    services.watcher.shutdown();
    drop(services);
    let _ = consumer.await;
    Ok(())
}
