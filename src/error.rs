//! Error types for the device health service.
//!
//! Errors are split by how the service reacts to them:
//!
//! - **`StoreError`**: the persistent region can no longer guarantee progress
//!   (growth past the configured maximum, a failed grow, a root structure that
//!   vanished after remapping, corruption). These are fatal. The event loop
//!   returns them to the caller and the process exits; continuing on top of a
//!   store that might be inconsistent is worse than a restart.
//! - **`PublishError`**: the external health write did not go through. Soft;
//!   the reconciler defers the device and retries on its timer.
//! - **`IngestError`**: an inbound notification was malformed. Soft; logged and
//!   dropped without touching the store.
//! - **`ConfigError`**: configuration could not be loaded or failed validation.
//!
//! A per-device capacity rejection is deliberately *not* an error. It is the
//! `Rejected` arm of [`crate::store::AddOutcome`].
//!
//! `ServiceError` consolidates the fatal paths via `#[from]` so the event loop
//! and the binary can use `?` throughout.

use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type AppResult<T> = std::result::Result<T, ServiceError>;

/// Fatal conditions raised by the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Growing would take the region past its configured maximum.
    #[error("Region growth to {requested} bytes would exceed the maximum of {maximum} bytes")]
    GrowthExceedsMaximum {
        /// Size the grow asked for
        requested: u64,
        /// Configured upper bound
        maximum: u64,
    },

    /// Resizing or remapping the backing file failed.
    #[error("Failed to grow region: {0}")]
    GrowthFailed(#[source] std::io::Error),

    /// A named structure vanished across a remap.
    #[error("Structure '{name}' missing from region after reopening it")]
    StructureMissingAfterReopen {
        /// Directory name that was looked up
        name: String,
    },

    /// An existing, non-empty region has no root structure.
    #[error("Region exists but structure '{name}' could not be located")]
    StructureMissing {
        /// Directory name that was looked up
        name: String,
    },

    /// A mutation ran out of space again right after a grow.
    #[error("Allocation still failed after growing region to {size} bytes")]
    ExhaustedAfterGrow {
        /// Region size after the grow
        size: u64,
    },

    /// The region header or an offset in it failed validation.
    #[error("Region corrupt: {0}")]
    Corrupt(String),

    /// Opening or flushing the backing file failed.
    #[error("Region I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons an external health write did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The device has no health object to write to.
    #[error("No health object exists for device '{0}' (yet)")]
    ObjectNotFound(String),

    /// The write itself failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Some of a device's health objects were not updated.
    #[error("Health update failed on {failed} of {total} objects")]
    Partial {
        /// Objects whose write failed
        failed: usize,
        /// Objects attempted
        total: usize,
    },
}

/// Malformed inbound notifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The error id is the empty string.
    #[error("Error id is empty")]
    EmptyErrorId,

    /// The error id is longer than the configured maximum.
    #[error("Error id length {length} exceeds the maximum of {max}")]
    ErrorIdTooLong {
        /// Length of the rejected id
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// The severity is neither critical nor warning.
    #[error("Unsupported severity '{0}'")]
    UnknownSeverity(String),

    /// A field needed to classify the notification is absent.
    #[error("Required field '{0}' missing")]
    MissingField(&'static str),

    /// No device name was supplied.
    #[error("Device name missing")]
    MissingDevice,

    /// The device name does not fit in a table key.
    #[error("Device name length {length} exceeds the maximum of {max}")]
    DeviceTooLong {
        /// Length of the rejected name
        length: usize,
        /// Longest name the store accepts
        max: usize,
    },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or merged.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values loaded but are out of range.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level error for the service event loop.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Fatal store condition.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration problem.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
