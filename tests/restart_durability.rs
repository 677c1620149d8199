//! Store contents survive a process restart.

use device_health::config::{RegionConfig, StoreConfig};
use device_health::core::Severity;
use device_health::store::region::MIN_REGION_SIZE;
use device_health::store::PersistentStore;
use std::collections::BTreeSet;

fn region_config(dir: &tempfile::TempDir) -> RegionConfig {
    RegionConfig {
        path: dir.path().join("device-health-region"),
        initial_size: MIN_REGION_SIZE,
        grow_increment: MIN_REGION_SIZE,
        maximum_size: 64 * MIN_REGION_SIZE,
    }
}

#[test]
fn test_reopen_restores_devices_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let region = region_config(&dir);

    {
        let mut store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
        store.add_critical_error("GPU0", "E1").unwrap();
        store.add_critical_error("GPU0", "E2").unwrap();
        store.add_warning_error("GPU0", "W1").unwrap();
        store.add_warning_error("GPU1", "W1").unwrap();
        store.flush().unwrap();
    }

    let store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
    let expected: BTreeSet<String> = ["GPU0", "GPU1"].iter().map(|s| s.to_string()).collect();
    assert_eq!(store.known_devices(), expected);
    assert_eq!(store.active_critical_count("GPU0"), 2);
    assert_eq!(store.active_warning_count("GPU0"), 1);
    assert_eq!(store.active_critical_count("GPU1"), 0);
    assert_eq!(store.active_warning_count("GPU1"), 1);
}

#[test]
fn test_grown_region_reopens_at_grown_size() {
    let dir = tempfile::tempdir().unwrap();
    let region = region_config(&dir);
    let id = |n: usize| format!("{:0>100}", n);

    let (size, snapshot) = {
        let mut store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
        for d in 0..4 {
            for n in 0..30 {
                assert!(store
                    .add_error(&format!("GPU{}", d), &id(n), Severity::Warning)
                    .unwrap()
                    .is_accepted());
            }
        }
        assert!(store.region_size() > MIN_REGION_SIZE);
        (store.region_size(), store.snapshot())
    };

    let store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
    assert_eq!(store.region_size(), size);
    assert_eq!(store.snapshot(), snapshot);
    for d in 0..4 {
        assert_eq!(store.active_warning_count(&format!("GPU{}", d)), 30);
    }
}

#[test]
fn test_devices_without_errors_stay_known() {
    let dir = tempfile::tempdir().unwrap();
    let region = region_config(&dir);

    {
        let mut store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
        store.add_critical_error("GPU7", "E1").unwrap();
        assert!(store.remove_error("GPU7", "E1").unwrap());
    }

    let store = PersistentStore::open(&region, &StoreConfig::default()).unwrap();
    assert!(store.known_devices().contains("GPU7"));
    assert_eq!(store.active_critical_count("GPU7"), 0);
}
