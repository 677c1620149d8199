//! Core data types shared by the store, the reconciler and ingest.
//!
//! - [`Severity`]: which per-device set an asserted error lives in
//! - [`Health`]: the coarse OK / Warning / Critical summary of a device
//! - [`DeviceErrors`]: an owned copy of one device's active error ids

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of fully qualified log entry severity values.
pub const LOG_LEVEL_PREFIX: &str = "xyz.openbmc_project.Logging.Entry.Level.";

/// Prefix of fully qualified health property values.
pub const HEALTH_TYPE_PREFIX: &str = "xyz.openbmc_project.State.Decorator.Health.HealthType.";

/// Severity of an asserted error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Counts toward [`Health::Critical`]
    Critical,
    /// Counts toward [`Health::Warning`]
    Warning,
}

impl Severity {
    /// Both severities, in the order their sets are stored.
    pub const ALL: [Severity; 2] = [Severity::Critical, Severity::Warning];

    /// Short name ("Critical" / "Warning").
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "Critical",
            Severity::Warning => "Warning",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = IngestError;

    /// Accepts the short form and the fully qualified log level form.
    /// Every other log level (Informational, Error, ...) is unsupported.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(LOG_LEVEL_PREFIX).unwrap_or(s) {
            "Critical" => Ok(Severity::Critical),
            "Warning" => Ok(Severity::Warning),
            _ => Err(IngestError::UnknownSeverity(s.to_string())),
        }
    }
}

/// Derived health of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    /// No active errors
    #[serde(rename = "OK")]
    Ok,
    /// Warnings only
    Warning,
    /// At least one critical error
    Critical,
}

impl Health {
    /// Derive health from active error counts. Critical dominates Warning.
    pub fn from_counts(critical: usize, warning: usize) -> Self {
        if critical > 0 {
            Health::Critical
        } else if warning > 0 {
            Health::Warning
        } else {
            Health::Ok
        }
    }

    /// Short name ("OK" / "Warning" / "Critical").
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "OK",
            Health::Warning => "Warning",
            Health::Critical => "Critical",
        }
    }

    /// Fully qualified property value written to the health object.
    pub fn qualified(&self) -> String {
        format!("{}{}", HEALTH_TYPE_PREFIX, self.as_str())
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned copy of one device's active error ids, sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceErrors {
    /// Device key
    pub device: String,
    /// Active critical error ids
    pub critical: Vec<String>,
    /// Active warning error ids
    pub warning: Vec<String>,
}

impl DeviceErrors {
    /// Health implied by this entry.
    pub fn health(&self) -> Health {
        Health::from_counts(self.critical.len(), self.warning.len())
    }
}
