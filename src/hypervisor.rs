//! Hypervisor queries
//!
//! The only thing asked of the hypervisor is which machines are running.
//! [`CommandHypervisor`] runs a configured command (by default
//! `virsh list --name --state-running`) and reads one name per line.

use crate::error::{Error, Result};
use crate::manifest::HypervisorConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Identities of the machines currently running
    async fn list_running(&self) -> Result<Vec<String>>;
}

pub struct CommandHypervisor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHypervisor {
    pub fn from_config(config: &HypervisorConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| Error::ConfigValidation("hypervisor.command cannot be empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl Hypervisor for CommandHypervisor {
    async fn list_running(&self) -> Result<Vec<String>> {
        debug!(program = %self.program, "Listing running machines");
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::Hypervisor(format!(
                "{} did not finish within {:?}",
                self.program, self.timeout
            ))
        })?
        .map_err(|e| Error::Hypervisor(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Hypervisor(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// One identity per non-empty line
fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fixed answer, switchable at runtime
#[cfg(test)]
pub struct StaticHypervisor {
    running: parking_lot::Mutex<Result<Vec<String>>>,
}

#[cfg(test)]
impl StaticHypervisor {
    pub fn new(running: &[&str]) -> Self {
        Self {
            running: parking_lot::Mutex::new(Ok(running.iter().map(|s| s.to_string()).collect())),
        }
    }

    pub fn set_running(&self, running: &[&str]) {
        *self.running.lock() = Ok(running.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_unavailable(&self) {
        *self.running.lock() = Err(Error::Hypervisor("hypervisor unavailable".into()));
    }
}

#[cfg(test)]
#[async_trait]
impl Hypervisor for StaticHypervisor {
    async fn list_running(&self) -> Result<Vec<String>> {
        match &*self.running.lock() {
            Ok(names) => Ok(names.clone()),
            Err(e) => Err(Error::Hypervisor(e.to_string())),
        }
    }
}
