//! Health snapshots
//!
//! A snapshot is the recorded health outcome of a machine at one point in
//! time. Snapshots are never modified: each completed check appends a new one
//! that supersedes the previous.

use crate::sickbay::report::{
    CheckReport, DefenderReport, DiskReport, HealthLevel, InventoryReport, ResourceReport,
    UpdatesReport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub machine_id: String,
    pub overall_status: HealthLevel,
    #[serde(default)]
    pub disk: Option<DiskReport>,
    #[serde(default)]
    pub resources: Option<ResourceReport>,
    #[serde(default)]
    pub updates: Option<UpdatesReport>,
    #[serde(default)]
    pub defender: Option<DefenderReport>,
    #[serde(default)]
    pub inventory: Option<InventoryReport>,
    #[serde(default)]
    pub custom: Option<Value>,
    pub checks_completed: u32,
    pub checks_failed: u32,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Build the snapshot that follows `previous` once `report` arrived
    ///
    /// An overall report replaces every sub-report. A single-check report
    /// replaces only its own and carries the rest forward.
    pub fn record(
        machine_id: &str,
        previous: Option<&HealthSnapshot>,
        report: CheckReport,
        execution_time_ms: u64,
    ) -> Self {
        let mut snapshot = match previous {
            Some(prev) if !matches!(report, CheckReport::Overall(_)) => HealthSnapshot {
                id: String::new(),
                machine_id: machine_id.to_string(),
                overall_status: HealthLevel::Healthy,
                disk: prev.disk.clone(),
                resources: prev.resources.clone(),
                updates: prev.updates.clone(),
                defender: prev.defender.clone(),
                inventory: prev.inventory.clone(),
                custom: prev.custom.clone(),
                checks_completed: 1,
                checks_failed: 0,
                execution_time_ms,
                error_summary: None,
                created_at: Utc::now(),
            },
            _ => Self::empty(machine_id, execution_time_ms),
        };
        snapshot.id = Uuid::new_v4().to_string();

        match report {
            CheckReport::Overall(overall) => {
                snapshot.disk = overall.disk;
                snapshot.resources = overall.resources;
                snapshot.updates = overall.updates;
                snapshot.defender = overall.defender;
                snapshot.inventory = overall.inventory;
                snapshot.checks_completed = snapshot.present_reports();
                snapshot.checks_failed = overall.errors.len() as u32;
                if !overall.errors.is_empty() {
                    snapshot.error_summary = Some(overall.errors.join("; "));
                }
            }
            CheckReport::DiskSpace(r) => snapshot.disk = Some(r),
            CheckReport::Resources(r) => snapshot.resources = Some(r),
            CheckReport::Updates(r) => snapshot.updates = Some(r),
            CheckReport::Defender(r) => snapshot.defender = Some(r),
            CheckReport::Inventory(r) => snapshot.inventory = Some(r),
            CheckReport::Custom(v) => snapshot.custom = Some(v),
        }

        snapshot.overall_status = snapshot.derive_level();
        snapshot
    }

    fn empty(machine_id: &str, execution_time_ms: u64) -> Self {
        HealthSnapshot {
            id: String::new(),
            machine_id: machine_id.to_string(),
            overall_status: HealthLevel::Healthy,
            disk: None,
            resources: None,
            updates: None,
            defender: None,
            inventory: None,
            custom: None,
            checks_completed: 1,
            checks_failed: 0,
            execution_time_ms,
            error_summary: None,
            created_at: Utc::now(),
        }
    }

    fn present_reports(&self) -> u32 {
        [
            self.disk.is_some(),
            self.resources.is_some(),
            self.updates.is_some(),
            self.defender.is_some(),
            self.inventory.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }

    /// Worst level among the present sub-reports; failed sub-checks count as warnings
    fn derive_level(&self) -> HealthLevel {
        let failed = if self.checks_failed > 0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };
        [
            self.disk.as_ref().map(DiskReport::level),
            self.resources.as_ref().map(ResourceReport::level),
            self.updates.as_ref().map(UpdatesReport::level),
            self.defender.as_ref().map(DefenderReport::level),
            Some(failed),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_default()
    }

    /// Whether the snapshot is younger than `window` at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.to_std().map(|age| age < window).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sickbay::report::{DriveUsage, OverallReport};

    fn disk(used: f64) -> DiskReport {
        DiskReport {
            drives: vec![DriveUsage {
                mount: "C:".into(),
                total_gb: 100.0,
                used_gb: used,
            }],
        }
    }

    #[test]
    fn test_overall_replaces_everything() {
        let report = CheckReport::Overall(OverallReport {
            disk: Some(disk(50.0)),
            updates: Some(UpdatesReport {
                pending: 2,
                critical: 0,
                reboot_required: false,
            }),
            errors: vec!["defender: service not found".into()],
            ..Default::default()
        });

        let snapshot = HealthSnapshot::record("vm-1", None, report, 1200);
        assert_eq!(snapshot.checks_completed, 2);
        assert_eq!(snapshot.checks_failed, 1);
        assert_eq!(snapshot.overall_status, HealthLevel::Warning);
        assert_eq!(
            snapshot.error_summary.as_deref(),
            Some("defender: service not found")
        );
        assert_eq!(snapshot.execution_time_ms, 1200);
    }

    #[test]
    fn test_single_check_carries_previous_reports() {
        let first = HealthSnapshot::record(
            "vm-1",
            None,
            CheckReport::Overall(OverallReport {
                disk: Some(disk(50.0)),
                updates: Some(UpdatesReport::default()),
                ..Default::default()
            }),
            10,
        );
        assert_eq!(first.overall_status, HealthLevel::Healthy);

        let second =
            HealthSnapshot::record("vm-1", Some(&first), CheckReport::DiskSpace(disk(95.0)), 5);
        assert_ne!(first.id, second.id);
        assert!(second.updates.is_some());
        assert_eq!(second.overall_status, HealthLevel::Error);
        assert_eq!(second.checks_completed, 1);
        // previous snapshot untouched
        assert_eq!(first.overall_status, HealthLevel::Healthy);
    }

    #[test]
    fn test_freshness_window() {
        let mut snapshot =
            HealthSnapshot::record("vm-1", None, CheckReport::DiskSpace(disk(10.0)), 1);
        let now = Utc::now();
        assert!(snapshot.is_fresh(now, Duration::from_secs(120)));

        snapshot.created_at = now - chrono::Duration::minutes(3);
        assert!(!snapshot.is_fresh(now, Duration::from_secs(120)));
    }
}
