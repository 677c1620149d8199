//! Message types for the health service event loop
//!
//! Every producer (stdin ingest, tests, a future bus adapter) talks to the
//! [`crate::service::HealthService`] through these commands. The loop handles
//! one command at a time, so store mutations, grows and publishes never
//! interleave.

use crate::core::{DeviceErrors, Health};
use crate::ingest::Notification;
use crate::store::AddOutcome;
use std::collections::BTreeSet;
use tokio::sync::oneshot;

/// What a notification did to the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Result of adding the asserted id
    Asserted(AddOutcome),
    /// Whether the deasserted id was active
    Deasserted {
        /// `true` if the id was removed from a set
        removed: bool,
    },
    /// Deassertion handling is switched off; nothing changed
    DeassertionDisabled,
}

/// Commands that can be sent to the health service
#[derive(Debug)]
pub enum HealthCommand {
    /// Apply an inbound notification and publish if the device changed
    Notify {
        /// Validated notification
        notification: Notification,
        /// Receives what the store did
        response: oneshot::Sender<NotifyOutcome>,
    },

    /// Current derived health of a device
    GetHealth {
        /// Device to evaluate
        device: String,
        /// Receives the health value
        response: oneshot::Sender<Health>,
    },

    /// Owned copy of every device entry
    GetSnapshot {
        /// Receives the snapshot
        response: oneshot::Sender<Vec<DeviceErrors>>,
    },

    /// Devices waiting for a publish retry
    GetDeferred {
        /// Receives the deferred devices
        response: oneshot::Sender<BTreeSet<String>>,
    },

    /// Flush the region and stop the loop
    Shutdown {
        /// Signalled once the region is flushed
        response: oneshot::Sender<()>,
    },
}

impl HealthCommand {
    /// Helper to create a Notify command
    pub fn notify(notification: Notification) -> (Self, oneshot::Receiver<NotifyOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Notify {
                notification,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetHealth command
    pub fn get_health(device: impl Into<String>) -> (Self, oneshot::Receiver<Health>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GetHealth {
                device: device.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetSnapshot command
    pub fn get_snapshot() -> (Self, oneshot::Receiver<Vec<DeviceErrors>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetSnapshot { response: tx }, rx)
    }

    /// Helper to create a GetDeferred command
    pub fn get_deferred() -> (Self, oneshot::Receiver<BTreeSet<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetDeferred { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
