//! Guest channel plumbing
//!
//! Provides:
//! - A transport seam producing byte streams to guest agents
//! - Request/reply correlation over newline-delimited JSON
//! - Per-machine connection state with keep-alive metrics
//! - The watcher owning heartbeats, reconnection and safe command sends

pub mod dispatch;
pub mod link;
pub mod registry;
#[cfg(test)]
pub mod testing;
pub mod transport;
pub mod watcher;

pub use dispatch::Action;
pub use transport::UnixSocketConnector;
pub use watcher::Watcher;
