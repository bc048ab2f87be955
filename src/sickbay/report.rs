//! Typed health check reports
//!
//! The guest agent answers every health check with a JSON document whose
//! shape depends on the check type. Replies are decoded here, once, at the
//! channel boundary; everything past this point works on typed reports.

use crate::sickbay::check::CheckType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Severity of a report or snapshot, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "healthy"),
            HealthLevel::Warning => write!(f, "warning"),
            HealthLevel::Error => write!(f, "error"),
        }
    }
}

const DISK_WARNING_PERCENT: f64 = 80.0;
const DISK_ERROR_PERCENT: f64 = 90.0;
const RESOURCE_WARNING_PERCENT: f64 = 85.0;
const RESOURCE_ERROR_PERCENT: f64 = 95.0;
const SIGNATURE_MAX_AGE_DAYS: u32 = 7;

/// Usage of one volume inside the guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveUsage {
    pub mount: String,
    pub total_gb: f64,
    pub used_gb: f64,
}

impl DriveUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_gb <= 0.0 {
            return 0.0;
        }
        self.used_gb / self.total_gb * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DiskReport {
    #[serde(default)]
    pub drives: Vec<DriveUsage>,
}

impl DiskReport {
    pub fn level(&self) -> HealthLevel {
        self.drives
            .iter()
            .map(|d| {
                let used = d.used_percent();
                if used >= DISK_ERROR_PERCENT {
                    HealthLevel::Error
                } else if used >= DISK_WARNING_PERCENT {
                    HealthLevel::Warning
                } else {
                    HealthLevel::Healthy
                }
            })
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Tuning suggestions produced by the agent
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ResourceReport {
    pub fn level(&self) -> HealthLevel {
        let peak = self.cpu_percent.max(self.memory_percent);
        if peak >= RESOURCE_ERROR_PERCENT {
            HealthLevel::Error
        } else if peak >= RESOURCE_WARNING_PERCENT {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UpdatesReport {
    #[serde(default)]
    pub pending: u32,
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub reboot_required: bool,
}

impl UpdatesReport {
    pub fn level(&self) -> HealthLevel {
        if self.critical > 0 || self.reboot_required {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenderReport {
    pub enabled: bool,
    #[serde(default)]
    pub real_time_protection: bool,
    #[serde(default)]
    pub threats_detected: u32,
    #[serde(default)]
    pub signature_age_days: Option<u32>,
}

impl DefenderReport {
    pub fn level(&self) -> HealthLevel {
        if !self.enabled || self.threats_detected > 0 {
            HealthLevel::Error
        } else if !self.real_time_protection
            || self
                .signature_age_days
                .is_some_and(|age| age > SIGNATURE_MAX_AGE_DAYS)
        {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledApplication {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InventoryReport {
    #[serde(default)]
    pub applications: Vec<InstalledApplication>,
}

/// Answer to an overall status check: every sub-report the agent could produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OverallReport {
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
    /// Sub-checks the agent could not complete
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A decoded health check answer, one shape per check type
#[derive(Debug, Clone, PartialEq)]
pub enum CheckReport {
    Overall(OverallReport),
    DiskSpace(DiskReport),
    Resources(ResourceReport),
    Updates(UpdatesReport),
    Defender(DefenderReport),
    Inventory(InventoryReport),
    Custom(Value),
}

impl CheckReport {
    /// Decode a raw agent reply for the given check type
    pub fn decode(check: CheckType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match check {
            CheckType::OverallStatus => CheckReport::Overall(serde_json::from_value(value)?),
            CheckType::DiskSpace => CheckReport::DiskSpace(serde_json::from_value(value)?),
            CheckType::ResourceOptimization => {
                CheckReport::Resources(serde_json::from_value(value)?)
            }
            CheckType::WindowsUpdates => CheckReport::Updates(serde_json::from_value(value)?),
            CheckType::WindowsDefender => CheckReport::Defender(serde_json::from_value(value)?),
            CheckType::ApplicationInventory => {
                CheckReport::Inventory(serde_json::from_value(value)?)
            }
            CheckType::Custom => CheckReport::Custom(value),
        })
    }

    /// Re-encode the report for storage on the task
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            CheckReport::Overall(r) => serde_json::to_value(r),
            CheckReport::DiskSpace(r) => serde_json::to_value(r),
            CheckReport::Resources(r) => serde_json::to_value(r),
            CheckReport::Updates(r) => serde_json::to_value(r),
            CheckReport::Defender(r) => serde_json::to_value(r),
            CheckReport::Inventory(r) => serde_json::to_value(r),
            CheckReport::Custom(v) => Ok(v.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }
}
