//! The health service context and its event loop.
//!
//! [`HealthService`] owns everything that used to be process-wide state: the
//! persistent store, the reconciler with its deferred set and retry timer, and
//! the ingest policy. [`HealthService::run`] processes one command or timer
//! tick at a time to completion, which is what makes region growth safe: no
//! other access to the store can be in flight while it is remapped.

use crate::config::ServiceConfig;
use crate::core::Health;
use crate::error::{AppResult, ServiceError, StoreError};
use crate::health::{compute_health, HealthReconciler, HealthSink};
use crate::ingest::{Assertion, Deassertion, Notification};
use crate::messages::{HealthCommand, NotifyOutcome};
use crate::store::{AddOutcome, PersistentStore, Rejection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Single owner of the store and the reconciler.
pub struct HealthService<S> {
    store: PersistentStore,
    reconciler: HealthReconciler<S>,
    deassertion_enabled: bool,
}

impl<S: HealthSink + 'static> HealthService<S> {
    /// Open the configured store and wrap it with a reconciler publishing to
    /// `sink`.
    pub fn open(config: &ServiceConfig, sink: S) -> Result<Self, ServiceError> {
        let store = PersistentStore::open(&config.region, &config.store)?;
        Ok(Self::new(store, sink, config))
    }

    /// Wrap an already opened store.
    pub fn new(store: PersistentStore, sink: S, config: &ServiceConfig) -> Self {
        Self {
            store,
            reconciler: HealthReconciler::new(sink, config.reconciler.retry_interval),
            deassertion_enabled: config.ingest.deassertion_enabled,
        }
    }

    /// Record an asserted error and publish the device if it is active.
    ///
    /// A capacity rejection is logged and returned without publishing; the
    /// device did not change.
    pub async fn on_error_asserted(&mut self, assertion: &Assertion) -> Result<AddOutcome, StoreError> {
        let device = assertion.device();
        let outcome = self
            .store
            .add_error(device, assertion.error_id(), assertion.severity())?;

        match outcome {
            AddOutcome::Added => {
                info!(
                    device = %device,
                    error_id = %assertion.error_id(),
                    severity = %assertion.severity(),
                    "error asserted"
                );
            }
            AddOutcome::AlreadyActive => {
                debug!(device = %device, error_id = %assertion.error_id(), "error already active");
            }
            AddOutcome::Rejected(Rejection::CapacityExceeded { severity, limit }) => {
                error!(
                    device = %device,
                    error_id = %assertion.error_id(),
                    severity = %severity,
                    limit,
                    "too many asserted errors; error id dropped"
                );
                return Ok(outcome);
            }
        }

        self.reconciler.publish(&self.store, device).await;
        Ok(outcome)
    }

    /// Clear a resolved error and publish the device if it changed.
    pub async fn on_error_deasserted(
        &mut self,
        deassertion: &Deassertion,
    ) -> Result<NotifyOutcome, StoreError> {
        let device = deassertion.device();
        if !self.deassertion_enabled {
            debug!(device = %device, error_id = %deassertion.error_id(), "deassertion disabled; ignoring");
            return Ok(NotifyOutcome::DeassertionDisabled);
        }

        let removed = self.store.remove_error(device, deassertion.error_id())?;
        if removed {
            info!(device = %device, error_id = %deassertion.error_id(), "error deasserted");
            self.reconciler.publish(&self.store, device).await;
        } else {
            debug!(device = %device, error_id = %deassertion.error_id(), "deasserted error was not active");
        }
        Ok(NotifyOutcome::Deasserted { removed })
    }

    /// Dispatch a validated notification to the matching handler.
    pub async fn on_notification(&mut self, notification: &Notification) -> Result<NotifyOutcome, StoreError> {
        match notification {
            Notification::Asserted(a) => Ok(NotifyOutcome::Asserted(self.on_error_asserted(a).await?)),
            Notification::Deasserted(d) => self.on_error_deasserted(d).await,
        }
    }

    /// Publish every known device once.
    pub async fn bootstrap(&mut self) {
        self.reconciler.bootstrap(&self.store).await;
    }

    /// Health currently derived for `device`.
    pub fn health(&self, device: &str) -> Health {
        compute_health(&self.store, device)
    }

    /// Read access to the store.
    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// Read access to the reconciler.
    pub fn reconciler(&self) -> &HealthReconciler<S> {
        &self.reconciler
    }

    /// Run the event loop until shutdown or until the command channel closes.
    ///
    /// Publishes the restored state first. Any fatal store condition ends the
    /// loop with an error; pending responders are dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<HealthCommand>) -> AppResult<()> {
        info!(path = %self.store.path().display(), "health service started");
        self.bootstrap().await;

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle(command).await? {
                                break;
                            }
                        }
                        None => {
                            info!("command channel closed");
                            break;
                        }
                    }
                }
                _ = self.reconciler.tick() => {
                    self.reconciler.retry_deferred(&self.store).await;
                }
            }
        }

        self.store.flush()?;
        info!("health service stopped");
        Ok(())
    }

    /// Spawn [`Self::run`] on the current runtime.
    pub fn spawn(
        self,
        capacity: usize,
    ) -> (mpsc::Sender<HealthCommand>, JoinHandle<AppResult<()>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, tokio::spawn(self.run(rx)))
    }

    /// Returns `false` when the loop should stop.
    async fn handle(&mut self, command: HealthCommand) -> AppResult<bool> {
        match command {
            HealthCommand::Notify {
                notification,
                response,
            } => {
                let outcome = self.on_notification(&notification).await?;
                let _ = response.send(outcome);
            }

            HealthCommand::GetHealth { device, response } => {
                let _ = response.send(self.health(&device));
            }

            HealthCommand::GetSnapshot { response } => {
                let _ = response.send(self.store.snapshot());
            }

            HealthCommand::GetDeferred { response } => {
                let _ = response.send(self.reconciler.deferred_devices().clone());
            }

            HealthCommand::Shutdown { response } => {
                info!("shutdown requested");
                self.store.flush()?;
                let _ = response.send(());
                return Ok(false);
            }
        }
        Ok(true)
    }
}
