//! Device table and error-id sets laid out inside the region.
//!
//! ```text
//! root object   [table: Offset]
//! device table  [len: u32] [entry; len]    entry = [key, critical set, warning set]
//! id set        [len: u32] [string; len]
//! string        [len: u32] [bytes; len]
//! ```
//!
//! Tables and sets are sorted by byte order of the string they reference and
//! searched by bisection. Every change is copy-on-write: the replacement block
//! is fully written before a single `u32` store publishes it, then the old
//! block is freed. An allocation failure therefore never leaves a half-applied
//! change behind, which is what makes the grow-then-retry policy safe.

use super::region::{Exhausted, Offset, Region};
use super::{AddOutcome, Rejection};
use crate::core::{DeviceErrors, Severity};
use std::cmp::Ordering;

/// Fixed name of the root object in the region's directory.
pub const ROOT_NAME: &str = "DeviceAssertedErrorsMap";

/// Payload size of the root object.
pub const ROOT_SIZE: usize = 4;

const LEN_FIELD: u32 = 4;
const ENTRY_SIZE: u32 = 12;
const ITEM_SIZE: u32 = 4;

/// View of the device table through the root object at a known offset.
///
/// Holds only an offset, so it carries no borrow of the mapping and must be
/// re-resolved from the directory whenever the region is remapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTable {
    root: Offset,
}

impl DeviceTable {
    /// Wrap the root object found at `root`.
    pub fn new(root: Offset) -> Self {
        Self { root }
    }

    fn table(&self, r: &Region) -> Offset {
        r.read_u32(self.root)
    }

    /// Number of known devices.
    pub fn len(&self, r: &Region) -> u32 {
        block_len(r, self.table(r))
    }

    /// Whether no device has ever been recorded.
    pub fn is_empty(&self, r: &Region) -> bool {
        self.len(r) == 0
    }

    /// Bisect for `device`: `Ok(index)` if present, `Err(insert_at)` otherwise.
    pub fn find(&self, r: &Region, device: &str) -> Result<u32, u32> {
        let table = self.table(r);
        bisect(block_len(r, table), device.as_bytes(), |i| {
            string_at(r, r.read_u32(entry_at(table, i)))
        })
    }

    /// Number of active ids of `severity` for `device` (0 if unknown).
    pub fn count(&self, r: &Region, device: &str, severity: Severity) -> usize {
        match self.find(r, device) {
            Ok(index) => {
                let set = r.read_u32(set_slot(self.table(r), index, severity));
                block_len(r, set) as usize
            }
            Err(_) => 0,
        }
    }

    /// Keys of every device ever recorded, in byte order.
    pub fn devices(&self, r: &Region) -> Vec<String> {
        let table = self.table(r);
        (0..block_len(r, table))
            .map(|i| lossy(string_at(r, r.read_u32(entry_at(table, i)))))
            .collect()
    }

    /// Owned copy of every device entry.
    pub fn snapshot(&self, r: &Region) -> Vec<DeviceErrors> {
        let table = self.table(r);
        (0..block_len(r, table))
            .map(|i| {
                let entry = entry_at(table, i);
                let ids = |severity: Severity| -> Vec<String> {
                    let set = r.read_u32(set_slot(table, i, severity));
                    (0..block_len(r, set))
                        .map(|j| lossy(string_at(r, r.read_u32(item_at(set, j)))))
                        .collect()
                };
                DeviceErrors {
                    device: lossy(string_at(r, r.read_u32(entry))),
                    critical: ids(Severity::Critical),
                    warning: ids(Severity::Warning),
                }
            })
            .collect()
    }

    /// Add `id` to the `severity` set of `device`, creating the device entry
    /// if needed.
    ///
    /// The device entry is created even when the id is then rejected or the
    /// id allocation fails; a retry finds it in place.
    pub fn insert_id(
        &self,
        r: &mut Region,
        device: &str,
        id: &str,
        severity: Severity,
        limit: usize,
    ) -> Result<AddOutcome, Exhausted> {
        let index = self.ensure_device(r, device)?;
        let slot = set_slot(self.table(r), index, severity);
        let set = r.read_u32(slot);
        let len = block_len(r, set);

        // A full set rejects every insert, including one already present
        if len as usize >= limit {
            return Ok(AddOutcome::Rejected(Rejection::CapacityExceeded {
                severity,
                limit,
            }));
        }
        let pos = match bisect(len, id.as_bytes(), |j| string_at(r, r.read_u32(item_at(set, j)))) {
            Ok(_) => return Ok(AddOutcome::AlreadyActive),
            Err(pos) => pos,
        };

        let item = alloc_string(r, id)?;
        let new_set = match r.alloc((LEN_FIELD + (len + 1) * ITEM_SIZE) as usize) {
            Ok(block) => block,
            Err(e) => {
                r.free(item);
                return Err(e);
            }
        };
        r.write_u32(new_set, len + 1);
        if set != 0 {
            r.copy_within(item_at(set, 0), item_at(new_set, 0), pos * ITEM_SIZE);
            r.copy_within(item_at(set, pos), item_at(new_set, pos + 1), (len - pos) * ITEM_SIZE);
        }
        r.write_u32(item_at(new_set, pos), item);

        r.write_u32(slot, new_set);
        r.free(set);
        Ok(AddOutcome::Added)
    }

    /// Remove `id` from both sets of `device`. Returns whether it was present
    /// in at least one of them.
    pub fn remove_id(&self, r: &mut Region, device: &str, id: &str) -> Result<bool, Exhausted> {
        let index = match self.find(r, device) {
            Ok(index) => index,
            Err(_) => return Ok(false),
        };
        let mut removed = false;
        for severity in Severity::ALL {
            let slot = set_slot(self.table(r), index, severity);
            removed |= remove_from_set(r, slot, id)?;
        }
        Ok(removed)
    }

    fn ensure_device(&self, r: &mut Region, device: &str) -> Result<u32, Exhausted> {
        let index = match self.find(r, device) {
            Ok(index) => return Ok(index),
            Err(index) => index,
        };
        let table = self.table(r);
        let len = block_len(r, table);

        let key = alloc_string(r, device)?;
        let new_table = match r.alloc((LEN_FIELD + (len + 1) * ENTRY_SIZE) as usize) {
            Ok(block) => block,
            Err(e) => {
                r.free(key);
                return Err(e);
            }
        };
        r.write_u32(new_table, len + 1);
        if table != 0 {
            r.copy_within(entry_at(table, 0), entry_at(new_table, 0), index * ENTRY_SIZE);
            r.copy_within(
                entry_at(table, index),
                entry_at(new_table, index + 1),
                (len - index) * ENTRY_SIZE,
            );
        }
        // Sets start out empty (zeroed by the allocator)
        r.write_u32(entry_at(new_table, index), key);

        r.write_u32(self.root, new_table);
        r.free(table);
        tracing::debug!(device, "created device entry");
        Ok(index)
    }
}

fn remove_from_set(r: &mut Region, slot: u32, id: &str) -> Result<bool, Exhausted> {
    let set = r.read_u32(slot);
    let len = block_len(r, set);
    let pos = match bisect(len, id.as_bytes(), |j| string_at(r, r.read_u32(item_at(set, j)))) {
        Ok(pos) => pos,
        Err(_) => return Ok(false),
    };
    let item = r.read_u32(item_at(set, pos));

    let new_set = if len == 1 {
        0
    } else {
        let block = r.alloc((LEN_FIELD + (len - 1) * ITEM_SIZE) as usize)?;
        r.write_u32(block, len - 1);
        r.copy_within(item_at(set, 0), item_at(block, 0), pos * ITEM_SIZE);
        r.copy_within(item_at(set, pos + 1), item_at(block, pos), (len - pos - 1) * ITEM_SIZE);
        block
    };

    r.write_u32(slot, new_set);
    r.free(set);
    r.free(item);
    Ok(true)
}

/// Length prefix of a table, set or string block; zero for a null offset.
fn block_len(r: &Region, block: Offset) -> u32 {
    if block == 0 {
        0
    } else {
        r.read_u32(block)
    }
}

fn entry_at(table: Offset, index: u32) -> u32 {
    table + LEN_FIELD + index * ENTRY_SIZE
}

fn set_slot(table: Offset, index: u32, severity: Severity) -> u32 {
    let field = match severity {
        Severity::Critical => 4,
        Severity::Warning => 8,
    };
    entry_at(table, index) + field
}

fn item_at(set: Offset, index: u32) -> u32 {
    set + LEN_FIELD + index * ITEM_SIZE
}

fn string_at(r: &Region, string: Offset) -> &[u8] {
    r.bytes(string + LEN_FIELD, block_len(r, string))
}

fn alloc_string(r: &mut Region, value: &str) -> Result<Offset, Exhausted> {
    let block = r.alloc(LEN_FIELD as usize + value.len())?;
    r.write_u32(block, value.len() as u32);
    r.bytes_mut(block + LEN_FIELD, value.len() as u32)
        .copy_from_slice(value.as_bytes());
    Ok(block)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Binary search over `len` sorted strings produced by `key_at`.
fn bisect<'a>(len: u32, wanted: &[u8], key_at: impl Fn(u32) -> &'a [u8]) -> Result<u32, u32> {
    let (mut lo, mut hi) = (0u32, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match key_at(mid).cmp(wanted) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::region::MIN_REGION_SIZE;

    fn new_table(size: u64) -> (tempfile::TempDir, Region, DeviceTable) {
        let temp_dir = tempfile::tempdir().unwrap();
        let (mut region, _) =
            Region::open_or_create(&temp_dir.path().join("region"), size).unwrap();
        let root = region.construct(ROOT_NAME, ROOT_SIZE).unwrap();
        (temp_dir, region, DeviceTable::new(root))
    }

    #[test]
    fn test_devices_kept_sorted() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        for device in ["GPU2", "CPU0", "GPU0", "NVSwitch1"] {
            table
                .insert_id(&mut r, device, "E1", Severity::Warning, 50)
                .unwrap();
        }
        assert_eq!(table.devices(&r), vec!["CPU0", "GPU0", "GPU2", "NVSwitch1"]);
        assert_eq!(table.find(&r, "GPU2"), Ok(2));
        assert_eq!(table.find(&r, "GPU1"), Err(2));
    }

    #[test]
    fn test_ids_kept_sorted_and_deduplicated() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        for id in ["E3", "E1", "E2", "E1"] {
            table
                .insert_id(&mut r, "GPU0", id, Severity::Critical, 50)
                .unwrap();
        }
        let snapshot = table.snapshot(&r);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].critical, vec!["E1", "E2", "E3"]);
        assert!(snapshot[0].warning.is_empty());
    }

    #[test]
    fn test_full_set_rejects_before_duplicate_check() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        let add = |r: &mut Region, id: &str| table.insert_id(r, "GPU0", id, Severity::Critical, 2);
        let full = AddOutcome::Rejected(Rejection::CapacityExceeded {
            severity: Severity::Critical,
            limit: 2,
        });
        assert_eq!(add(&mut r, "A").unwrap(), AddOutcome::Added);
        assert_eq!(add(&mut r, "A").unwrap(), AddOutcome::AlreadyActive);
        assert_eq!(add(&mut r, "B").unwrap(), AddOutcome::Added);
        assert_eq!(add(&mut r, "A").unwrap(), full);
        assert_eq!(add(&mut r, "C").unwrap(), full);
        assert_eq!(table.snapshot(&r)[0].critical, vec!["A", "B"]);
    }

    #[test]
    fn test_remove_middle_and_last() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        for id in ["A", "B", "C"] {
            table
                .insert_id(&mut r, "GPU0", id, Severity::Warning, 50)
                .unwrap();
        }
        assert!(table.remove_id(&mut r, "GPU0", "B").unwrap());
        assert_eq!(table.snapshot(&r)[0].warning, vec!["A", "C"]);
        assert!(table.remove_id(&mut r, "GPU0", "A").unwrap());
        assert!(table.remove_id(&mut r, "GPU0", "C").unwrap());
        assert_eq!(table.count(&r, "GPU0", Severity::Warning), 0);
        assert!(!table.remove_id(&mut r, "GPU0", "C").unwrap());
        // The device entry outlives its errors
        assert_eq!(table.devices(&r), vec!["GPU0"]);
    }

    #[test]
    fn test_churn_reuses_freed_blocks() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        table
            .insert_id(&mut r, "GPU0", "warmup", Severity::Critical, 50)
            .unwrap();
        table.remove_id(&mut r, "GPU0", "warmup").unwrap();
        let top = r.arena_top();

        for _ in 0..1000 {
            table
                .insert_id(&mut r, "GPU0", "E1", Severity::Critical, 50)
                .unwrap();
            assert!(table.remove_id(&mut r, "GPU0", "E1").unwrap());
        }
        assert_eq!(r.arena_top(), top);
    }

    #[test]
    fn test_failed_insert_leaves_no_partial_state() {
        let (_dir, mut r, table) = new_table(MIN_REGION_SIZE);
        let mut inserted = Vec::new();
        let long_id = |n: usize| format!("{:0>100}", n);
        let mut n = 0;
        let err = loop {
            match table.insert_id(&mut r, "GPU0", &long_id(n), Severity::Critical, 1000) {
                Ok(outcome) => {
                    assert_eq!(outcome, AddOutcome::Added);
                    inserted.push(long_id(n));
                    n += 1;
                }
                Err(e) => break e,
            }
        };
        assert!(err.requested > 0);
        assert_eq!(table.count(&r, "GPU0", Severity::Critical), inserted.len());
        assert_eq!(table.snapshot(&r)[0].critical, inserted);
    }
}
