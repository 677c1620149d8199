//! Memory-mapped, growable region backing the persistent store.
//!
//! The region is a plain file mapped shared into the process. It survives
//! process death: everything written through the mapping lands in the page
//! cache and is seen again by the next process that maps the same file.
//!
//! # Layout
//!
//! ```text
//! +--------------------------- 256 byte header ---------------------------+
//! | magic u64 | version u32 | arena_top u32 | write_epoch u64 | reserved  |
//! | free list heads: [u32; 24] (one per power-of-two size class)          |
//! | named-object directory: 2 x (name [u8; 32], offset u32)               |
//! +-----------------------------------------------------------------------+
//! | arena: blocks of [class u32 | next u32 | payload (16 << class bytes)] |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! All references inside the arena are `u32` payload offsets from the start of
//! the file, never addresses, so they remain meaningful after the file is
//! remapped at a larger size. Anything that *is* an address (a slice borrowed
//! from the mapping) cannot outlive the `&self`/`&mut self` borrow it came
//! from, and the mapping is replaced only through `&mut` access to its owner.
//!
//! # Allocation
//!
//! Segregated free lists by size class, bump allocation from `arena_top`
//! otherwise. Blocks are never split or merged, so a freed block is always
//! reusable by the next request of the same class. When the bump pointer would
//! pass the end of the file, allocation reports [`Exhausted`]; the store
//! reacts by growing the region.

use crate::error::StoreError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Magic number for region header validation
const MAGIC: u64 = 0xDE_71_CE_4E_A1_70_00_01;

/// Layout version written into new regions
const LAYOUT_VERSION: u32 = 1;

/// Size of the region header in bytes
pub const HEADER_SIZE: u32 = 256;

/// Smallest region the store can operate in
pub const MIN_REGION_SIZE: u64 = 4096;

/// Number of power-of-two size classes (16 B up to 128 MiB payloads)
const SIZE_CLASSES: u32 = 24;

/// Smallest block payload
const MIN_PAYLOAD: u32 = 16;

/// Per-block bookkeeping: size class and free-list link
const BLOCK_HEADER: u32 = 8;

/// Longest name accepted by the named-object directory
pub const MAX_NAME_LEN: usize = 32;

const DIRECTORY_SLOTS: u32 = 2;
const DIRECTORY_SLOT_SIZE: u32 = MAX_NAME_LEN as u32 + 4;

// Header field offsets
const MAGIC_OFF: u32 = 0;
const VERSION_OFF: u32 = 8;
const ARENA_TOP_OFF: u32 = 12;
const EPOCH_OFF: u32 = 16;
const FREE_HEADS_OFF: u32 = 32;
const DIRECTORY_OFF: u32 = FREE_HEADS_OFF + SIZE_CLASSES * 4;

const _: () = assert!(
    DIRECTORY_OFF + DIRECTORY_SLOTS * DIRECTORY_SLOT_SIZE <= HEADER_SIZE,
    "region header fields must fit in HEADER_SIZE"
);

/// Payload offset of a block inside the region. Zero means "none".
pub type Offset = u32;

/// The allocator ran out of space in the current mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    /// Payload bytes that could not be allocated
    pub requested: usize,
}

/// Owned handle to the mapped region.
///
/// Dropping the handle unmaps the region. A grown region is a new handle; the
/// old one is dropped when the new one replaces it.
pub struct Region {
    path: PathBuf,
    mmap: MmapMut,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("arena_top", &self.arena_top())
            .field("write_epoch", &self.write_epoch())
            .finish()
    }
}

impl Region {
    /// Attach to the region at `path`, creating it at `initial_size` if it is
    /// missing or empty.
    ///
    /// Returns the region and whether it was freshly initialised. An existing
    /// region is reused as-is, whatever its current size.
    pub fn open_or_create(path: &Path, initial_size: u64) -> Result<(Self, bool), StoreError> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);

        let is_new_file = !path.exists();

        // Only truncate when creating a brand-new region; preserve existing data otherwise.
        if is_new_file {
            opts.truncate(true);
        }

        let file = opts.open(path)?;
        let existing_size = file.metadata()?.len();

        if is_new_file || existing_size == 0 {
            file.set_len(initial_size)?;
            let mut region = Self::map(path, &file)?;
            region.init_header();
            region.flush()?;
            tracing::info!(path = %path.display(), size = initial_size, "created region");
            return Ok((region, true));
        }

        let mut region = Self::map(path, &file)?;
        region.validate()?;
        region.recover_epoch();
        tracing::info!(path = %path.display(), size = existing_size, "attached to existing region");
        Ok((region, false))
    }

    /// Extend the backing file to `new_len` bytes and map it again.
    ///
    /// The caller must replace its handle with the returned one. Offsets stay
    /// valid across the remap; addresses do not.
    pub fn grown(&self, new_len: u64) -> Result<Self, StoreError> {
        self.flush()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(StoreError::GrowthFailed)?;
        file.set_len(new_len).map_err(StoreError::GrowthFailed)?;

        let region = Self::map(&self.path, &file)?;
        region.validate()?;
        Ok(region)
    }

    fn map(path: &Path, file: &File) -> Result<Self, StoreError> {
        // SAFETY: the file is opened read/write and sized before mapping. The
        // service is the single owner of the region file; no other process
        // truncates it while it is mapped.
        let mmap = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    fn init_header(&mut self) {
        self.mmap[..HEADER_SIZE as usize].fill(0);
        self.write_u64(MAGIC_OFF, MAGIC);
        self.write_u32(VERSION_OFF, LAYOUT_VERSION);
        self.write_u32(ARENA_TOP_OFF, HEADER_SIZE);
        self.write_u64(EPOCH_OFF, 0);
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.len() < u64::from(HEADER_SIZE) {
            return Err(StoreError::Corrupt(format!(
                "region is {} bytes, smaller than its {} byte header",
                self.len(),
                HEADER_SIZE
            )));
        }
        let magic = self.read_u64(MAGIC_OFF);
        if magic != MAGIC {
            return Err(StoreError::Corrupt(format!(
                "invalid magic number: expected 0x{:016X}, got 0x{:016X}",
                MAGIC, magic
            )));
        }
        let version = self.read_u32(VERSION_OFF);
        if version != LAYOUT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported layout version {}",
                version
            )));
        }
        let top = self.arena_top();
        if top < HEADER_SIZE || u64::from(top) > self.len() {
            return Err(StoreError::Corrupt(format!(
                "arena top {} outside region of {} bytes",
                top,
                self.len()
            )));
        }
        for class in 0..SIZE_CLASSES {
            let head = self.free_head(class);
            if head != 0 && !self.is_block(head) {
                return Err(StoreError::Corrupt(format!(
                    "free list {} points outside the arena ({})",
                    class, head
                )));
            }
        }
        for slot in 0..DIRECTORY_SLOTS {
            let offset = self.read_u32(DIRECTORY_OFF + slot * DIRECTORY_SLOT_SIZE + MAX_NAME_LEN as u32);
            if offset != 0 && !self.is_block(offset) {
                return Err(StoreError::Corrupt(format!(
                    "directory slot {} points outside the arena ({})",
                    slot, offset
                )));
            }
        }
        Ok(())
    }

    /// Whether `offset` is the payload of a block lying wholly inside the
    /// allocated arena.
    pub fn is_block(&self, offset: Offset) -> bool {
        let top = self.arena_top();
        if offset < HEADER_SIZE + BLOCK_HEADER || offset >= top {
            return false;
        }
        let class = self.read_u32(offset - BLOCK_HEADER);
        class < SIZE_CLASSES && u64::from(offset) + u64::from(MIN_PAYLOAD << class) <= u64::from(top)
    }

    /// An odd epoch means the previous owner died mid-update. Mutations only
    /// publish through a final pointer swap, so the structure is still
    /// consistent; at worst a block leaked.
    fn recover_epoch(&mut self) {
        let epoch = self.write_epoch();
        if epoch % 2 != 0 {
            tracing::warn!(
                epoch,
                "region was left mid-update by a previous process; resuming"
            );
            self.write_u64(EPOCH_OFF, epoch + 1);
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Whether the mapping is empty (never true for a valid region).
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Bytes handed out by the bump allocator so far, header included.
    pub fn arena_top(&self) -> u32 {
        self.read_u32(ARENA_TOP_OFF)
    }

    /// Write epoch (odd while a mutation is in flight).
    pub fn write_epoch(&self) -> u64 {
        self.read_u64(EPOCH_OFF)
    }

    /// Flush dirty pages of the mapping to the backing file.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Run `op` as one mutation, bracketing it with epoch increments.
    pub fn update<T, E>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E> {
        let epoch = self.write_epoch();
        self.write_u64(EPOCH_OFF, epoch.wrapping_add(1));
        let result = op(self);
        let epoch = self.write_epoch();
        self.write_u64(EPOCH_OFF, epoch.wrapping_add(1));
        result
    }

    // ---------------------------------------------------------------------
    // Named-object directory
    // ---------------------------------------------------------------------

    /// Locate a named object.
    pub fn find(&self, name: &str) -> Option<Offset> {
        let wanted = encode_name(name)?;
        (0..DIRECTORY_SLOTS).find_map(|slot| {
            let base = DIRECTORY_OFF + slot * DIRECTORY_SLOT_SIZE;
            let offset = self.read_u32(base + MAX_NAME_LEN as u32);
            (offset != 0 && self.bytes(base, MAX_NAME_LEN as u32) == wanted.as_slice())
                .then_some(offset)
        })
    }

    /// Allocate a zeroed object of `len` bytes and register it under `name`.
    pub fn construct(&mut self, name: &str, len: usize) -> Result<Offset, StoreError> {
        let encoded = encode_name(name).ok_or_else(|| {
            StoreError::Corrupt(format!("object name '{}' longer than {}", name, MAX_NAME_LEN))
        })?;
        let slot = (0..DIRECTORY_SLOTS)
            .map(|slot| DIRECTORY_OFF + slot * DIRECTORY_SLOT_SIZE)
            .find(|base| self.read_u32(base + MAX_NAME_LEN as u32) == 0)
            .ok_or_else(|| StoreError::Corrupt("named-object directory is full".to_string()))?;

        let offset = self.alloc(len).map_err(|e| {
            StoreError::Corrupt(format!(
                "region too small for {} byte object '{}'",
                e.requested, name
            ))
        })?;
        self.bytes_mut(slot, MAX_NAME_LEN as u32)
            .copy_from_slice(&encoded);
        // Publishing the offset last makes the object visible in one write.
        self.write_u32(slot + MAX_NAME_LEN as u32, offset);
        Ok(offset)
    }

    // ---------------------------------------------------------------------
    // Allocator
    // ---------------------------------------------------------------------

    /// Allocate a zeroed block with room for at least `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<Offset, Exhausted> {
        let exhausted = Exhausted { requested: len };
        let class = size_class(len).ok_or(exhausted)?;
        let payload = MIN_PAYLOAD << class;

        let head = self.free_head(class);
        if head != 0 {
            let next = self.read_u32(head - BLOCK_HEADER + 4);
            self.set_free_head(class, next);
            self.write_u32(head - BLOCK_HEADER + 4, 0);
            self.bytes_mut(head, payload).fill(0);
            return Ok(head);
        }

        let top = self.arena_top();
        let end = u64::from(top) + u64::from(BLOCK_HEADER) + u64::from(payload);
        if end > self.len() {
            return Err(exhausted);
        }
        self.write_u32(top, class);
        self.write_u32(top + 4, 0);
        // end <= len <= u32::MAX, enforced by config validation
        self.write_u32(ARENA_TOP_OFF, end as u32);
        Ok(top + BLOCK_HEADER)
    }

    /// Return a block to its size-class free list.
    pub fn free(&mut self, offset: Offset) {
        if offset == 0 {
            return;
        }
        let block = offset - BLOCK_HEADER;
        let class = self.read_u32(block);
        let head = self.free_head(class);
        self.write_u32(block + 4, head);
        self.set_free_head(class, offset);
    }

    fn free_head(&self, class: u32) -> Offset {
        self.read_u32(FREE_HEADS_OFF + class * 4)
    }

    fn set_free_head(&mut self, class: u32, offset: Offset) {
        self.write_u32(FREE_HEADS_OFF + class * 4, offset);
    }

    // ---------------------------------------------------------------------
    // Raw access
    // ---------------------------------------------------------------------

    /// Borrow `len` bytes at `offset`.
    pub fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        let start = offset as usize;
        &self.mmap[start..start + len as usize]
    }

    /// Mutably borrow `len` bytes at `offset`.
    pub fn bytes_mut(&mut self, offset: u32, len: u32) -> &mut [u8] {
        let start = offset as usize;
        &mut self.mmap[start..start + len as usize]
    }

    /// Copy `len` bytes from `src` to `dst` inside the mapping.
    pub fn copy_within(&mut self, src: u32, dst: u32, len: u32) {
        let start = src as usize;
        self.mmap
            .copy_within(start..start + len as usize, dst as usize);
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(offset, 4));
        u32::from_le_bytes(buf)
    }

    /// Write a little-endian `u32` at `offset`.
    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.bytes_mut(offset, 4)
            .copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: u32) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(offset, 8));
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, offset: u32, value: u64) {
        self.bytes_mut(offset, 8)
            .copy_from_slice(&value.to_le_bytes());
    }
}

/// Smallest size class whose payload holds `len` bytes.
fn size_class(len: usize) -> Option<u32> {
    (0..SIZE_CLASSES).find(|class| (MIN_PAYLOAD as usize) << class >= len)
}

fn encode_name(name: &str) -> Option<[u8; MAX_NAME_LEN]> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return None;
    }
    let mut encoded = [0u8; MAX_NAME_LEN];
    encoded[..name.len()].copy_from_slice(name.as_bytes());
    Some(encoded)
}
