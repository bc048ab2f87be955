//! Health check domain model
//!
//! Provides:
//! - Health check tasks with priority, retry bookkeeping and lifecycle rules
//! - Typed per-check reports decoded at the guest channel boundary
//! - Immutable health snapshots built from those reports

pub mod check;
pub mod report;
pub mod snapshot;

pub use check::{CheckType, HealthCheckTask, Priority, TaskStatus};
pub use report::{CheckReport, HealthLevel};
pub use snapshot::HealthSnapshot;
