//! Guest transports
//!
//! A [`Connector`] turns a machine id into a byte stream to its guest agent.
//! The production transport is the Unix socket the hypervisor exposes for
//! each guest's virtio-serial channel.

use crate::error::{Error, Result};
use crate::manifest::WatchkeeperConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::debug;

/// An established byte stream to one guest agent
pub struct GuestChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Human readable description of where the stream goes
    pub endpoint: String,
}

/// What the transport can tell about an endpoint without opening it
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointProbe {
    pub endpoint: String,
    pub present: bool,
    /// Extra finding, e.g. the path exists but is not a socket
    pub detail: Option<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, machine_id: &str) -> Result<GuestChannel>;

    async fn probe_endpoint(&self, machine_id: &str) -> EndpointProbe;
}

/// Connects to `<socket_dir>/<machine_id>.sock` or a per-machine override
pub struct UnixSocketConnector {
    socket_dir: PathBuf,
    overrides: HashMap<String, PathBuf>,
    connect_timeout: Duration,
}

impl UnixSocketConnector {
    pub fn new(socket_dir: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            socket_dir,
            overrides: HashMap::new(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &WatchkeeperConfig) -> Self {
        let mut connector = Self::new(
            config.config.socket_dir.clone(),
            config.heartbeat.connect_timeout(),
        );
        for machine in &config.machines {
            connector.overrides.insert(
                machine.id.clone(),
                machine.socket_path(&config.config.socket_dir),
            );
        }
        connector
    }

    pub fn socket_path(&self, machine_id: &str) -> PathBuf {
        self.overrides
            .get(machine_id)
            .cloned()
            .unwrap_or_else(|| self.socket_dir.join(format!("{}.sock", machine_id)))
    }
}

#[async_trait]
impl Connector for UnixSocketConnector {
    async fn connect(&self, machine_id: &str) -> Result<GuestChannel> {
        let path = self.socket_path(machine_id);
        debug!(machine = %machine_id, socket = %path.display(), "Connecting to guest agent");

        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&path))
            .await
            .map_err(|_| Error::Connection {
                machine: machine_id.to_string(),
                message: format!(
                    "connect to {} timed out after {:?}",
                    path.display(),
                    self.connect_timeout
                ),
            })?
            .map_err(|e| Error::Connection {
                machine: machine_id.to_string(),
                message: format!("connect to {}: {}", path.display(), e),
            })?;

        let (reader, writer) = stream.into_split();
        Ok(GuestChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            endpoint: path.display().to_string(),
        })
    }

    async fn probe_endpoint(&self, machine_id: &str) -> EndpointProbe {
        let path = self.socket_path(machine_id);
        let endpoint = path.display().to_string();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.file_type().is_socket() => EndpointProbe {
                endpoint,
                present: true,
                detail: None,
            },
            Ok(_) => EndpointProbe {
                endpoint,
                present: true,
                detail: Some("path exists but is not a socket".to_string()),
            },
            Err(e) => EndpointProbe {
                endpoint,
                present: false,
                detail: Some(e.to_string()),
            },
        }
    }
}
