//! Crash-persistent store of asserted errors per device.
//!
//! [`PersistentStore`] owns the memory-mapped [`region::Region`] and the
//! device table inside it. The region outlives the process: reopening the same
//! path after a restart yields the errors asserted before it.
//!
//! # Growth
//!
//! The region starts at `initial_size` and the allocator inside it reports
//! exhaustion when a mutation does not fit. Every mutating call then follows
//! the same two-step sequence:
//!
//! 1. run the operation; if it fits, done
//! 2. otherwise grow the region by `grow_increment` (fatal past
//!    `maximum_size`), replace the region handle, re-resolve the root object
//!    by name, and run the operation exactly once more; a second exhaustion is
//!    fatal
//!
//! A per-device capacity rejection is not exhaustion. It comes back as
//! [`AddOutcome::Rejected`] and never triggers growth.

pub mod region;
pub mod table;

use crate::config::{RegionConfig, StoreConfig};
use crate::core::{DeviceErrors, Severity};
use crate::error::StoreError;
use region::{Exhausted, Region, HEADER_SIZE};
use std::collections::BTreeSet;
use std::path::Path;
use table::{DeviceTable, ROOT_NAME, ROOT_SIZE};
use tracing::{error, info, warn};

/// Why an insert was refused without mutating the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The device's set for this severity is already full
    CapacityExceeded {
        /// Set that is full
        severity: Severity,
        /// Configured cap per device and severity
        limit: usize,
    },
}

/// Result of adding an error id to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The id was inserted
    Added,
    /// The id was already active; nothing changed
    AlreadyActive,
    /// The id was refused; nothing changed
    Rejected(Rejection),
}

impl AddOutcome {
    /// Whether the id is active after the call.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AddOutcome::Rejected(_))
    }
}

/// Growth limits of the region.
#[derive(Clone, Copy, Debug)]
struct Growth {
    increment: u64,
    maximum: u64,
}

/// Device → asserted errors mapping backed by a growable mapped file.
pub struct PersistentStore {
    region: Region,
    table: DeviceTable,
    growth: Growth,
    max_ids: usize,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("region", &self.region)
            .field("devices", &self.table.len(&self.region))
            .field("max_ids", &self.max_ids)
            .finish()
    }
}

impl PersistentStore {
    /// Attach to the configured region, creating it if absent.
    ///
    /// An existing region is reused as-is, including every error asserted
    /// before the restart. An existing region without the root object is
    /// treated as corrupt and is fatal.
    pub fn open(region_config: &RegionConfig, store_config: &StoreConfig) -> Result<Self, StoreError> {
        let (mut region, created) =
            Region::open_or_create(&region_config.path, region_config.initial_size)?;

        let root = match region.find(ROOT_NAME) {
            Some(root) => root,
            // A region whose arena was never touched died before its root was
            // constructed; finish the job.
            None if created || region.arena_top() == HEADER_SIZE => {
                region.construct(ROOT_NAME, ROOT_SIZE)?
            }
            None => {
                error!(path = %region_config.path.display(), "root structure missing from existing region");
                return Err(StoreError::StructureMissing {
                    name: ROOT_NAME.to_string(),
                });
            }
        };

        let table = region.read_u32(root);
        if table != 0 && !region.is_block(table) {
            error!(path = %region_config.path.display(), table, "device table outside the arena");
            return Err(StoreError::Corrupt(format!(
                "device table offset {} outside the arena",
                table
            )));
        }

        if region.len() > region_config.maximum_size {
            warn!(
                size = region.len(),
                maximum = region_config.maximum_size,
                "existing region is larger than the configured maximum; it will not grow further"
            );
        }

        let store = Self {
            region,
            table: DeviceTable::new(root),
            growth: Growth {
                increment: region_config.grow_increment,
                maximum: region_config.maximum_size,
            },
            max_ids: store_config.max_ids_per_device_severity,
        };
        info!(
            devices = store.table.len(&store.region),
            size = store.region.len(),
            "persistent store ready"
        );
        Ok(store)
    }

    /// Every device ever recorded, including ones with no active errors.
    pub fn known_devices(&self) -> BTreeSet<String> {
        self.table.devices(&self.region).into_iter().collect()
    }

    /// Number of active critical ids (0 for unknown devices).
    pub fn active_critical_count(&self, device: &str) -> usize {
        self.active_count(device, Severity::Critical)
    }

    /// Number of active warning ids (0 for unknown devices).
    pub fn active_warning_count(&self, device: &str) -> usize {
        self.active_count(device, Severity::Warning)
    }

    /// Number of active ids of `severity` (0 for unknown devices).
    pub fn active_count(&self, device: &str, severity: Severity) -> usize {
        self.table.count(&self.region, device, severity)
    }

    /// Add a critical error id. `Ok(false)` means the device's critical set is
    /// full and nothing changed.
    pub fn add_critical_error(&mut self, device: &str, error_id: &str) -> Result<bool, StoreError> {
        Ok(self.add_error(device, error_id, Severity::Critical)?.is_accepted())
    }

    /// Add a warning error id. `Ok(false)` means the device's warning set is
    /// full and nothing changed.
    pub fn add_warning_error(&mut self, device: &str, error_id: &str) -> Result<bool, StoreError> {
        Ok(self.add_error(device, error_id, Severity::Warning)?.is_accepted())
    }

    /// Add an error id of `severity`, creating the device entry lazily.
    ///
    /// Re-adding an active id is a no-op success while the set has room. A
    /// full set rejects every insert, including ids it already holds.
    pub fn add_error(
        &mut self,
        device: &str,
        error_id: &str,
        severity: Severity,
    ) -> Result<AddOutcome, StoreError> {
        let limit = self.max_ids;
        self.mutate(|table, r| table.insert_id(r, device, error_id, severity, limit))
    }

    /// Remove `error_id` from both sets of `device`. Returns whether it was
    /// active in at least one of them.
    pub fn remove_error(&mut self, device: &str, error_id: &str) -> Result<bool, StoreError> {
        self.mutate(|table, r| table.remove_id(r, device, error_id))
    }

    /// Owned copy of every device entry.
    pub fn snapshot(&self) -> Vec<DeviceErrors> {
        self.table.snapshot(&self.region)
    }

    /// Current size of the region in bytes.
    pub fn region_size(&self) -> u64 {
        self.region.len()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Flush the mapping to the backing file.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.region.flush()
    }

    /// Run `op`; on exhaustion grow once and run it once more.
    fn mutate<T>(
        &mut self,
        op: impl Fn(&DeviceTable, &mut Region) -> Result<T, Exhausted>,
    ) -> Result<T, StoreError> {
        let table = self.table;
        let exhausted = match self.region.update(|r| op(&table, r)) {
            Ok(value) => return Ok(value),
            Err(exhausted) => exhausted,
        };
        error!(
            requested = exhausted.requested,
            size = self.region.len(),
            "allocation failed; trying to increase region size"
        );

        self.grow()?;

        info!("retrying operation");
        let table = self.table;
        self.region.update(|r| op(&table, r)).map_err(|exhausted| {
            error!(
                requested = exhausted.requested,
                size = self.region.len(),
                "allocation still failed after growing; giving up"
            );
            StoreError::ExhaustedAfterGrow {
                size: self.region.len(),
            }
        })
    }

    /// Grow the region by one increment and re-resolve the root object.
    fn grow(&mut self) -> Result<(), StoreError> {
        let current = self.region.len();
        let requested = current + self.growth.increment;
        warn!(
            current,
            requested,
            maximum = self.growth.maximum,
            "region resize requested"
        );
        if requested > self.growth.maximum {
            error!(
                requested,
                maximum = self.growth.maximum,
                "resizing would exceed the maximum region size; cannot continue"
            );
            return Err(StoreError::GrowthExceedsMaximum {
                requested,
                maximum: self.growth.maximum,
            });
        }

        let grown = self.region.grown(requested).map_err(|e| {
            error!(error = %e, "region grow failed; cannot continue");
            e
        })?;
        // The old mapping is dropped here. `&mut self` guarantees nothing
        // borrowed from it is still alive.
        self.region = grown;
        warn!(size = self.region.len(), "region reopened");

        let root = self.region.find(ROOT_NAME).ok_or_else(|| {
            error!("root structure no longer in region after resize");
            StoreError::StructureMissingAfterReopen {
                name: ROOT_NAME.to_string(),
            }
        })?;
        self.table = DeviceTable::new(root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::region::MIN_REGION_SIZE;
    use tracing_test::traced_test;

    fn configs(dir: &tempfile::TempDir, initial: u64, increment: u64, maximum: u64) -> (RegionConfig, StoreConfig) {
        (
            RegionConfig {
                path: dir.path().join("device-health-region"),
                initial_size: initial,
                grow_increment: increment,
                maximum_size: maximum,
            },
            StoreConfig::default(),
        )
    }

    fn small_store(dir: &tempfile::TempDir) -> PersistentStore {
        let (region, store) = configs(dir, MIN_REGION_SIZE, MIN_REGION_SIZE, 16 * MIN_REGION_SIZE);
        PersistentStore::open(&region, &store).unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = small_store(&dir);

        assert!(store.add_critical_error("GPU0", "E1").unwrap());
        assert!(store.add_critical_error("GPU0", "E1").unwrap());
        assert_eq!(store.active_critical_count("GPU0"), 1);
        assert_eq!(store.active_warning_count("GPU0"), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (region, limits) = configs(&dir, 64 * 1024, 64 * 1024, 1024 * 1024);
        let mut store = PersistentStore::open(&region, &limits).unwrap();

        for i in 0..50 {
            assert!(store.add_critical_error("GPU0", &format!("E{}", i)).unwrap());
        }
        assert!(!store.add_critical_error("GPU0", "E50").unwrap());
        // Ids already in a full set are rejected too
        assert!(!store.add_critical_error("GPU0", "E0").unwrap());
        assert_eq!(store.active_critical_count("GPU0"), 50);

        // A full critical set does not affect the warning set
        assert!(store.add_warning_error("GPU0", "E50").unwrap());
        assert_eq!(
            store.add_error("GPU0", "E51", Severity::Critical).unwrap(),
            AddOutcome::Rejected(Rejection::CapacityExceeded {
                severity: Severity::Critical,
                limit: 50
            })
        );
    }

    #[test]
    fn test_remove_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = small_store(&dir);

        store.add_critical_error("GPU0", "E1").unwrap();
        store.add_warning_error("GPU0", "E1").unwrap();
        assert!(store.remove_error("GPU0", "E1").unwrap());
        assert_eq!(store.active_critical_count("GPU0"), 0);
        assert_eq!(store.active_warning_count("GPU0"), 0);
        assert!(!store.remove_error("GPU0", "E1").unwrap());
        assert!(!store.remove_error("GPU9", "E1").unwrap());
        assert!(store.known_devices().contains("GPU0"));
    }

    #[test]
    fn test_unknown_device_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(&dir);
        assert_eq!(store.active_critical_count("nope"), 0);
        assert!(store.known_devices().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_grow_and_retry_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = small_store(&dir);
        let initial = store.region_size();

        let id = |d: usize, n: usize| format!("ERR-{}-{:0>90}", d, n);
        let mut expected = Vec::new();
        'fill: for d in 0..8 {
            for n in 0..20 {
                let device = format!("GPU{}", d);
                assert!(store.add_critical_error(&device, &id(d, n)).unwrap());
                expected.push((device, n));
                if store.region_size() > initial + MIN_REGION_SIZE {
                    break 'fill;
                }
            }
        }

        assert!(store.region_size() > initial);
        assert_eq!(store.region_size() % MIN_REGION_SIZE, 0);
        assert!(logs_contain("region resize requested"));
        assert!(logs_contain("retrying operation"));
        for (device, _) in &expected {
            let count = expected.iter().filter(|(d, _)| d == device).count();
            assert_eq!(store.active_critical_count(device), count);
        }
        let snapshot = store.snapshot();
        for entry in &snapshot {
            let d: usize = entry.device.trim_start_matches("GPU").parse().unwrap();
            for (n, stored) in entry.critical.iter().enumerate() {
                assert_eq!(stored, &id(d, n));
            }
        }
    }

    #[test]
    fn test_growth_past_maximum_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (region, limits) = configs(&dir, MIN_REGION_SIZE, MIN_REGION_SIZE, MIN_REGION_SIZE);
        let mut store = PersistentStore::open(&region, &limits).unwrap();

        let mut inserted = 0;
        let err = loop {
            match store.add_warning_error("GPU0", &format!("{:0>100}", inserted)) {
                Ok(true) => inserted += 1,
                Ok(false) => panic!("cap reached before region filled"),
                Err(e) => break e,
            }
            assert!(inserted <= 50, "region never filled");
        };
        assert!(matches!(
            err,
            StoreError::GrowthExceedsMaximum {
                requested,
                maximum
            } if requested == 2 * MIN_REGION_SIZE && maximum == MIN_REGION_SIZE
        ));
        // Fail closed: nothing inserted so far was lost
        assert_eq!(store.region_size(), MIN_REGION_SIZE);
        assert_eq!(store.active_warning_count("GPU0"), inserted);
    }

    #[test]
    fn test_still_exhausted_after_grow_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // One increment is smaller than a single 100-byte id block
        let (region, limits) = configs(&dir, MIN_REGION_SIZE, 64, 16 * MIN_REGION_SIZE);
        let mut store = PersistentStore::open(&region, &limits).unwrap();

        let mut inserted = 0;
        let err = loop {
            match store.add_warning_error("GPU0", &format!("{:0>100}", inserted)) {
                Ok(true) => inserted += 1,
                Ok(false) => panic!("cap reached before region filled"),
                Err(e) => break e,
            }
            assert!(inserted < 50, "region never filled");
        };

        let size = store.region_size();
        assert!(size > MIN_REGION_SIZE);
        assert!(matches!(err, StoreError::ExhaustedAfterGrow { size: s } if s == size));
        // The failed insert left every earlier id in place
        assert_eq!(store.active_warning_count("GPU0"), inserted);
        assert_eq!(store.snapshot()[0].warning.len(), inserted);
    }

    #[test]
    fn test_corrupt_table_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (region_config, limits) = configs(&dir, MIN_REGION_SIZE, MIN_REGION_SIZE, 4 * MIN_REGION_SIZE);
        {
            let mut store = PersistentStore::open(&region_config, &limits).unwrap();
            store.add_critical_error("GPU0", "E1").unwrap();
        }
        {
            let (mut region, _) =
                Region::open_or_create(&region_config.path, MIN_REGION_SIZE).unwrap();
            let root = region.find(ROOT_NAME).unwrap();
            region.write_u32(root, 0x7FFF_0000);
        }
        let err = PersistentStore::open(&region_config, &limits).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_existing_region_without_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (region_config, limits) = configs(&dir, MIN_REGION_SIZE, MIN_REGION_SIZE, 4 * MIN_REGION_SIZE);
        {
            let (mut region, _) =
                Region::open_or_create(&region_config.path, MIN_REGION_SIZE).unwrap();
            region.construct("SomethingElse", 8).unwrap();
        }
        let err = PersistentStore::open(&region_config, &limits).unwrap_err();
        assert!(matches!(err, StoreError::StructureMissing { .. }));
    }

    #[test]
    fn test_reopen_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = small_store(&dir);
            store.add_critical_error("GPU0", "E1").unwrap();
            store.add_warning_error("GPU1", "W1").unwrap();
        }
        let store = small_store(&dir);
        assert_eq!(
            store.known_devices().into_iter().collect::<Vec<_>>(),
            vec!["GPU0", "GPU1"]
        );
        assert_eq!(store.active_critical_count("GPU0"), 1);
        assert_eq!(store.active_warning_count("GPU1"), 1);
    }
}
