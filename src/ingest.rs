//! Inbound fault notifications.
//!
//! Upstream delivers either a ready-made assertion / deassertion or a raw
//! logging entry. Both end up as a validated [`Notification`]; anything
//! malformed is an [`IngestError`] and must not touch the store.

use crate::core::Severity;
use crate::error::IngestError;
use crate::limits::{validate_device_key, validate_error_id};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Additional data key naming the affected device.
pub const DEVICE_NAME_KEY: &str = "DEVICE_NAME";

static ENTRY_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^/xyz/openbmc_project/logging/entry/(\d+)$").ok());

/// An error became active on a device. Only constructed validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assertion {
    device: String,
    error_id: String,
    severity: Severity,
}

impl Assertion {
    /// Validate raw fields into an assertion.
    pub fn new(
        device: &str,
        error_id: &str,
        severity: &str,
        max_error_id_length: usize,
    ) -> Result<Self, IngestError> {
        validate_device_key(device)?;
        validate_error_id(error_id, max_error_id_length)?;
        Ok(Self {
            device: device.to_string(),
            error_id: error_id.to_string(),
            severity: severity.parse()?,
        })
    }

    /// Affected device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Error id as it will be stored.
    pub fn error_id(&self) -> &str {
        &self.error_id
    }

    /// Set the id is recorded in.
    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// An error was resolved on a device. Only constructed validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deassertion {
    device: String,
    error_id: String,
}

impl Deassertion {
    /// Validate raw fields into a deassertion.
    pub fn new(device: &str, error_id: &str, max_error_id_length: usize) -> Result<Self, IngestError> {
        validate_device_key(device)?;
        validate_error_id(error_id, max_error_id_length)?;
        Ok(Self {
            device: device.to_string(),
            error_id: error_id.to_string(),
        })
    }

    /// Affected device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Error id to clear from every set.
    pub fn error_id(&self) -> &str {
        &self.error_id
    }
}

/// A validated inbound notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Record an active error.
    Asserted(Assertion),
    /// Clear a resolved error.
    Deasserted(Deassertion),
}

impl Notification {
    /// Device the notification applies to.
    pub fn device(&self) -> &str {
        match self {
            Notification::Asserted(a) => &a.device,
            Notification::Deasserted(d) => &d.device,
        }
    }
}

/// A logging entry as published by the logging service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Object path of the entry, `/xyz/openbmc_project/logging/entry/<N>`
    pub path: String,
    /// Logging level, full or short form
    #[serde(default)]
    pub severity: Option<String>,
    /// Event id recorded as the error id
    #[serde(default)]
    pub event_id: Option<String>,
    /// `KEY=VALUE` items
    #[serde(default)]
    pub additional_data: Vec<String>,
    /// Whether the entry has been marked resolved
    #[serde(default)]
    pub resolved: bool,
}

impl LogEntry {
    /// Numeric entry id from the object path, if it has the expected shape.
    pub fn entry_id(&self) -> Option<u32> {
        ENTRY_PATH
            .as_ref()?
            .captures(&self.path)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }

    /// First non-empty `DEVICE_NAME` value in the additional data.
    pub fn device(&self) -> Option<&str> {
        self.additional_data
            .iter()
            .filter_map(|item| item.split_once('='))
            .find(|(key, value)| *key == DEVICE_NAME_KEY && !value.is_empty())
            .map(|(_, value)| value)
    }

    /// Decide what this entry means for the store.
    ///
    /// Resolved entries deassert their event id and do not need a severity.
    pub fn classify(&self, max_error_id_length: usize) -> Result<Notification, IngestError> {
        let device = self.device().ok_or(IngestError::MissingDevice)?;
        let event_id = self
            .event_id
            .as_deref()
            .ok_or(IngestError::MissingField("EventId"))?;

        if self.resolved {
            return Deassertion::new(device, event_id, max_error_id_length).map(Notification::Deasserted);
        }
        let severity = self
            .severity
            .as_deref()
            .ok_or(IngestError::MissingField("Severity"))?;
        Assertion::new(device, event_id, severity, max_error_id_length).map(Notification::Asserted)
    }
}

/// One line of the JSON-lines ingest stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Explicit assertion.
    Asserted {
        /// Affected device
        device: String,
        /// Error id
        error_id: String,
        /// `Critical` or `Warning`, full or short form
        severity: String,
    },
    /// Explicit deassertion.
    Deasserted {
        /// Affected device
        device: String,
        /// Error id
        error_id: String,
    },
    /// Raw logging entry to classify.
    LogEntry(LogEntry),
}

impl InboundEvent {
    /// Validate the event into a [`Notification`].
    pub fn into_notification(self, max_error_id_length: usize) -> Result<Notification, IngestError> {
        match self {
            InboundEvent::Asserted {
                device,
                error_id,
                severity,
            } => Assertion::new(&device, &error_id, &severity, max_error_id_length)
                .map(Notification::Asserted),
            InboundEvent::Deasserted { device, error_id } => {
                Deassertion::new(&device, &error_id, max_error_id_length).map(Notification::Deasserted)
            }
            InboundEvent::LogEntry(entry) => entry.classify(max_error_id_length),
        }
    }
}
