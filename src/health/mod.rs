//! Device health derivation and publication.
//!
//! Health is a pure function of a device's active error counts (see
//! [`Health::from_counts`]). [`HealthReconciler`] pushes it to a
//! [`HealthSink`] and keeps retrying devices whose publish failed until the
//! sink accepts the value.

pub mod reconciler;
pub mod sink;

pub use crate::core::Health;
pub use reconciler::{HealthReconciler, RetryTimer};
pub use sink::{DirectorySink, HealthSink};

use crate::store::PersistentStore;

/// Current health of `device` as recorded in `store`.
///
/// Unknown devices have no active errors and are therefore OK.
pub fn compute_health(store: &PersistentStore, device: &str) -> Health {
    Health::from_counts(
        store.active_critical_count(device),
        store.active_warning_count(device),
    )
}
