//! Health publication with deferred retry.
//!
//! A publish that fails puts the device into the deferred set. The retry timer
//! runs only while that set is non-empty: it is armed when the first device is
//! deferred and disarmed as soon as the last one is published. Each retry
//! recomputes health from the store, so a device whose errors changed while
//! deferred is published with its current value.

use super::{compute_health, HealthSink};
use crate::store::PersistentStore;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic timer that exists only while armed.
#[derive(Debug)]
pub struct RetryTimer {
    period: Duration,
    interval: Option<Interval>,
}

impl RetryTimer {
    /// Disarmed timer ticking every `period` once armed.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// Start ticking every `period`, first tick one period from now. Does
    /// nothing if already armed.
    pub fn arm(&mut self) {
        if self.interval.is_some() {
            return;
        }
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Stop ticking.
    pub fn disarm(&mut self) {
        self.interval = None;
    }

    /// Whether the timer is ticking.
    pub fn is_armed(&self) -> bool {
        self.interval.is_some()
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick. Never completes while disarmed, so it can sit
    /// in a `select!` next to the command channel.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Publishes device health and retries failures on a timer.
pub struct HealthReconciler<S> {
    sink: S,
    deferred: BTreeSet<String>,
    timer: RetryTimer,
}

impl<S: HealthSink> HealthReconciler<S> {
    /// Reconciler with nothing deferred and the timer disarmed.
    pub fn new(sink: S, retry_interval: Duration) -> Self {
        Self {
            sink,
            deferred: BTreeSet::new(),
            timer: RetryTimer::new(retry_interval),
        }
    }

    /// Publish the current health of `device`.
    ///
    /// Returns whether the sink accepted it. On failure the device is deferred
    /// and the retry timer armed if this is the first deferred device.
    pub async fn publish(&mut self, store: &PersistentStore, device: &str) -> bool {
        let health = compute_health(store, device);
        match self.sink.set_device_health(device, health).await {
            Ok(()) => {
                warn!(device = %device, health = %health, "device health updated");
                // A fresh successful publish supersedes any pending retry
                self.settle(device);
                true
            }
            Err(e) => {
                info!(device = %device, health = %health, error = %e, "health update failed; deferring");
                if self.deferred.insert(device.to_string()) && self.deferred.len() == 1 {
                    debug!(period = ?self.timer.period(), "arming deferred update timer");
                    self.timer.arm();
                }
                false
            }
        }
    }

    /// Retry every deferred device once. Devices that publish are removed;
    /// the timer is disarmed when none remain.
    pub async fn retry_deferred(&mut self, store: &PersistentStore) {
        let pending: Vec<String> = self.deferred.iter().cloned().collect();
        debug!(count = pending.len(), "retrying deferred health updates");

        for device in pending {
            let health = compute_health(store, &device);
            match self.sink.set_device_health(&device, health).await {
                Ok(()) => {
                    warn!(device = %device, health = %health, "deferred device health updated");
                    self.deferred.remove(&device);
                }
                Err(e) => {
                    debug!(device = %device, error = %e, "deferred health update still failing");
                }
            }
        }

        if self.deferred.is_empty() {
            debug!("no deferred devices left; disarming timer");
            self.timer.disarm();
        }
    }

    /// Publish every device the store knows, so external state matches what
    /// survived a restart.
    pub async fn bootstrap(&mut self, store: &PersistentStore) {
        let devices = store.known_devices();
        info!(count = devices.len(), "publishing restored device health");
        for device in &devices {
            self.publish(store, device).await;
        }
    }

    /// Wait for the retry timer. Pending forever while nothing is deferred.
    pub async fn tick(&mut self) {
        self.timer.tick().await;
    }

    /// Devices whose last publish failed.
    pub fn deferred_devices(&self) -> &BTreeSet<String> {
        &self.deferred
    }

    /// Whether the retry timer is running.
    pub fn is_timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// The sink health is published to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn settle(&mut self, device: &str) {
        if self.deferred.remove(device) && self.deferred.is_empty() {
            self.timer.disarm();
        }
    }
}
