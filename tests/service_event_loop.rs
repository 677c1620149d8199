//! End-to-end behaviour of the health service event loop.

use async_trait::async_trait;
use device_health::config::ServiceConfig;
use device_health::core::Health;
use device_health::error::{PublishError, ServiceError, StoreError};
use device_health::health::HealthSink;
use device_health::ingest::{Assertion, Deassertion, Notification};
use device_health::messages::{HealthCommand, NotifyOutcome};
use device_health::service::HealthService;
use device_health::store::region::MIN_REGION_SIZE;
use device_health::store::{AddOutcome, PersistentStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Sink whose devices only accept writes once their object "exists".
#[derive(Default)]
struct FakeBus {
    present: Mutex<HashSet<String>>,
    published: Mutex<Vec<(String, Health)>>,
}

impl FakeBus {
    fn create_object(&self, device: &str) {
        self.present.lock().unwrap().insert(device.to_string());
    }

    fn published(&self) -> Vec<(String, Health)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthSink for FakeBus {
    async fn set_device_health(&self, device: &str, health: Health) -> Result<(), PublishError> {
        if !self.present.lock().unwrap().contains(device) {
            return Err(PublishError::ObjectNotFound(device.to_string()));
        }
        self.published.lock().unwrap().push((device.to_string(), health));
        Ok(())
    }
}

fn config(dir: &tempfile::TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.region.path = dir.path().join("region");
    config.region.initial_size = MIN_REGION_SIZE;
    config.region.grow_increment = MIN_REGION_SIZE;
    config.region.maximum_size = 8 * MIN_REGION_SIZE;
    config.reconciler.retry_interval = Duration::from_secs(10);
    config.ingest.deassertion_enabled = true;
    config
}

async fn notify(tx: &mpsc::Sender<HealthCommand>, notification: Notification) -> NotifyOutcome {
    let (command, response) = HealthCommand::notify(notification);
    tx.send(command).await.unwrap();
    response.await.unwrap()
}

async fn deferred(tx: &mpsc::Sender<HealthCommand>) -> Vec<String> {
    let (command, response) = HealthCommand::get_deferred();
    tx.send(command).await.unwrap();
    response.await.unwrap().into_iter().collect()
}

async fn shutdown(tx: &mpsc::Sender<HealthCommand>) {
    let (command, response) = HealthCommand::shutdown();
    tx.send(command).await.unwrap();
    response.await.unwrap();
}

fn asserted(device: &str, id: &str, severity: &str) -> Notification {
    Notification::Asserted(Assertion::new(device, id, severity, 100).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_deferred_publish_converges_on_timer() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(FakeBus::default());
    let service = HealthService::open(&config(&dir), bus.clone()).unwrap();
    let (tx, task) = service.spawn(8);

    let outcome = notify(&tx, asserted("GPU0", "E1", "Critical")).await;
    assert_eq!(outcome, NotifyOutcome::Asserted(AddOutcome::Added));
    assert_eq!(deferred(&tx).await, vec!["GPU0"]);

    // The owning service comes up; the next timer tick publishes
    bus.create_object("GPU0");
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(deferred(&tx).await.is_empty());
    assert_eq!(bus.published(), vec![("GPU0".to_string(), Health::Critical)]);

    shutdown(&tx).await;
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_publishes_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(FakeBus::default());
    let service = HealthService::open(&config(&dir), bus.clone()).unwrap();
    let (tx, task) = service.spawn(8);

    notify(&tx, asserted("GPU0", "E1", "Critical")).await;
    notify(&tx, asserted("GPU0", "W1", "Warning")).await;
    let outcome = notify(
        &tx,
        Notification::Deasserted(Deassertion::new("GPU0", "E1", 100).unwrap()),
    )
    .await;
    assert_eq!(outcome, NotifyOutcome::Deasserted { removed: true });

    bus.create_object("GPU0");
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(bus.published(), vec![("GPU0".to_string(), Health::Warning)]);
    shutdown(&tx).await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bootstrap_publishes_restored_state() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    {
        let mut store = PersistentStore::open(&cfg.region, &cfg.store).unwrap();
        store.add_critical_error("GPU0", "E1").unwrap();
        store.add_warning_error("GPU1", "W1").unwrap();
    }

    let bus = Arc::new(FakeBus::default());
    bus.create_object("GPU0");
    bus.create_object("GPU1");
    let service = HealthService::open(&cfg, bus.clone()).unwrap();
    let (tx, task) = service.spawn(8);

    let (command, response) = HealthCommand::get_health("GPU1");
    tx.send(command).await.unwrap();
    assert_eq!(response.await.unwrap(), Health::Warning);

    assert_eq!(
        bus.published(),
        vec![
            ("GPU0".to_string(), Health::Critical),
            ("GPU1".to_string(), Health::Warning)
        ]
    );
    shutdown(&tx).await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_growth_past_maximum_stops_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.region.maximum_size = MIN_REGION_SIZE;
    let bus = Arc::new(FakeBus::default());
    let service = HealthService::open(&cfg, bus).unwrap();
    let (tx, task) = service.spawn(8);

    for n in 0..50 {
        let id = format!("{:0>100}", n);
        let notification = asserted("GPU0", &id, "Warning");
        let (command, response) = HealthCommand::notify(notification);
        if tx.send(command).await.is_err() || response.await.is_err() {
            break;
        }
    }

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(ServiceError::Store(StoreError::GrowthExceedsMaximum { .. }))
    ));
}

#[tokio::test]
async fn test_snapshot_reflects_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(FakeBus::default());
    let service = HealthService::open(&config(&dir), bus).unwrap();
    let (tx, task) = service.spawn(8);

    notify(&tx, asserted("GPU1", "E9", "Critical")).await;
    notify(&tx, asserted("GPU0", "W1", "Warning")).await;
    notify(&tx, asserted("GPU0", "W1", "Warning")).await;

    let (command, response) = HealthCommand::get_snapshot();
    tx.send(command).await.unwrap();
    let snapshot = response.await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].device, "GPU0");
    assert_eq!(snapshot[0].warning, vec!["W1"]);
    assert_eq!(snapshot[1].critical, vec!["E9"]);
    assert_eq!(snapshot[1].health(), Health::Critical);

    shutdown(&tx).await;
    task.await.unwrap().unwrap();
}
