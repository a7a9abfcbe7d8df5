//! The persistent swap area.
//!
//! A fixed region of the swap block device is carved into page-sized
//! slots. The pool is system-wide: heap pages from every process share
//! it, so the free/used bitmap sits behind its own lock. Slot content
//! transfers run outside that lock; a slot is only ever touched by the
//! fault path that currently owns it.

#![allow(clippy::cast_possible_truncation)]

pub mod page_replacement;

use crate::block::{Block, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::{boxed::Box, vec, vec::Vec};
use core::fmt;
use medulla_shared::mem::PAGE_FRAME_SIZE;
use medulla_shared::sizes::SWAP_SLOTS;
use once_cell::race::OnceBox;

/// Index of a slot in the swap pool.
pub type SwapSlot = u32;

/// First sector of the swap area on the swap device.
pub const SWAP_START: BlockSector = 10240;

const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// Every slot in the pool is in use.
    PoolExhausted,
    /// The swap device failed a transfer.
    Io(BlockError),
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "swap pool exhausted"),
            Self::Io(err) => write!(f, "swap i/o failed: {err}"),
        }
    }
}

impl core::error::Error for SwapError {}

impl From<BlockError> for SwapError {
    fn from(err: BlockError) -> Self {
        Self::Io(err)
    }
}

/// Free/used state of every slot, one bit each, grouped into words.
/// A set bit means the slot is free.
struct SlotBitmap {
    groups: Vec<u64>,
}

impl SlotBitmap {
    fn new_all_free(slots: u32) -> Self {
        let mut groups = vec![u64::MAX; (slots as usize).div_ceil(64)];
        // Clear the tail bits past `slots` so they can never be handed out.
        let tail = slots as usize % 64;
        if tail != 0 {
            if let Some(last) = groups.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self { groups }
    }

    fn allocate_lowest(&mut self) -> Option<SwapSlot> {
        for (group_index, group) in self.groups.iter_mut().enumerate() {
            if *group != 0 {
                let bit = group.trailing_zeros();
                *group &= !(1u64 << bit);
                return Some(group_index as u32 * 64 + bit);
            }
        }
        None
    }

    fn free(&mut self, slot: SwapSlot) {
        let group = &mut self.groups[slot as usize / 64];
        let mask = 1u64 << (slot % 64);
        debug_assert!(*group & mask == 0, "freeing a free swap slot");
        *group |= mask;
    }

    fn is_free(&self, slot: SwapSlot) -> bool {
        self.groups[slot as usize / 64] & (1u64 << (slot % 64)) != 0
    }

    fn free_count(&self) -> u32 {
        self.groups.iter().map(|g| g.count_ones()).sum()
    }
}

/// The system-wide pool of swap slots.
pub struct SwapPool {
    start_sector: BlockSector,
    slots: u32,
    bitmap: Mutex<SlotBitmap>,
}

impl SwapPool {
    /// A pool of `slots` page-sized slots whose backing storage begins at
    /// `start_sector` on the swap device. All slots start out free.
    pub fn new(start_sector: BlockSector, slots: u32) -> Self {
        Self {
            start_sector,
            slots,
            bitmap: Mutex::new(SlotBitmap::new_all_free(slots)),
        }
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    pub fn used_slots(&self) -> u32 {
        self.slots - self.bitmap.lock().free_count()
    }

    pub fn is_free(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_free(slot)
    }

    /// Reserve the lowest-indexed free slot.
    pub fn allocate(&self) -> Result<SwapSlot, SwapError> {
        self.bitmap
            .lock()
            .allocate_lowest()
            .ok_or(SwapError::PoolExhausted)
    }

    /// Return `slot` to the pool.
    pub fn free(&self, slot: SwapSlot) {
        debug_assert!(slot < self.slots);
        self.bitmap.lock().free(slot);
    }

    fn slot_sector(&self, slot: SwapSlot) -> BlockSector {
        debug_assert!(slot < self.slots);
        self.start_sector + slot * SECTORS_PER_PAGE as u32
    }

    /// Read one page out of `slot` into `page`.
    pub fn read_slot(
        &self,
        device: &mut Block,
        slot: SwapSlot,
        page: &mut [u8],
    ) -> Result<(), SwapError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let base = self.slot_sector(slot);
        for (i, chunk) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            device.read(base + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Write one page from `page` into `slot`. Returns once the device
    /// has acknowledged every sector.
    pub fn write_slot(
        &self,
        device: &mut Block,
        slot: SwapSlot,
        page: &[u8],
    ) -> Result<(), SwapError> {
        debug_assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let base = self.slot_sector(slot);
        for (i, chunk) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            device.write(base + i as u32, chunk)?;
        }
        Ok(())
    }
}

static SWAP_POOL: OnceBox<SwapPool> = OnceBox::new();

/// Set up the kernel-wide pool with the default geometry. Called once
/// while the swap device is brought up.
pub fn swap_pool_init() {
    let pool = SwapPool::new(SWAP_START, SWAP_SLOTS as u32);
    assert!(
        SWAP_POOL.set(Box::new(pool)).is_ok(),
        "swap pool already initialized"
    );
}

/// The kernel-wide pool. Fault-path code takes a `&SwapPool` parameter
/// instead of calling this, so it can run against a private pool in tests;
/// only the trap glue resolves the singleton.
pub fn swap_pool() -> &'static SwapPool {
    SWAP_POOL.get().expect("swap pool not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::test::mem_disk;

    #[test]
    fn test_allocates_lowest_free_slot() {
        let pool = SwapPool::new(0, 8);
        assert_eq!(pool.slots(), 8);
        assert_eq!(pool.allocate(), Ok(0));
        assert_eq!(pool.allocate(), Ok(1));
        assert_eq!(pool.allocate(), Ok(2));
        assert!(!pool.is_free(0));
        assert!(pool.is_free(3));

        pool.free(1);
        assert!(pool.is_free(1));
        assert_eq!(pool.allocate(), Ok(1));
        assert_eq!(pool.allocate(), Ok(3));
        assert_eq!(pool.used_slots(), 4);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = SwapPool::new(0, 2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert_eq!(pool.allocate(), Err(SwapError::PoolExhausted));

        pool.free(0);
        assert_eq!(pool.allocate(), Ok(0));
    }

    #[test]
    fn test_bitmap_wider_than_one_group() {
        let pool = SwapPool::new(0, 100);
        for expected in 0..100 {
            assert_eq!(pool.allocate(), Ok(expected));
        }
        assert_eq!(pool.allocate(), Err(SwapError::PoolExhausted));
        pool.free(77);
        assert_eq!(pool.allocate(), Ok(77));
    }

    #[test]
    fn test_slot_contents_roundtrip() {
        let pool = SwapPool::new(16, 4);
        let mut disk = mem_disk("swap", 16 + 4 * SECTORS_PER_PAGE as u32);

        let mut page = vec![0u8; PAGE_FRAME_SIZE];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let slot = pool.allocate().unwrap();
        pool.write_slot(&mut disk, slot, &page).unwrap();

        let mut back = vec![0u8; PAGE_FRAME_SIZE];
        pool.read_slot(&mut disk, slot, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn test_slots_do_not_overlap_on_disk() {
        let pool = SwapPool::new(0, 2);
        let mut disk = mem_disk("swap", 2 * SECTORS_PER_PAGE as u32);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.write_slot(&mut disk, a, &vec![0x11; PAGE_FRAME_SIZE]).unwrap();
        pool.write_slot(&mut disk, b, &vec![0x22; PAGE_FRAME_SIZE]).unwrap();

        let mut back = vec![0u8; PAGE_FRAME_SIZE];
        pool.read_slot(&mut disk, a, &mut back).unwrap();
        assert!(back.iter().all(|&x| x == 0x11));
    }

    #[test]
    #[should_panic(expected = "freeing a free swap slot")]
    fn test_double_free_is_a_bug() {
        let pool = SwapPool::new(0, 4);
        let slot = pool.allocate().unwrap();
        pool.free(slot);
        pool.free(slot);
    }

    #[test]
    fn test_io_error_propagates() {
        use crate::block::block_core::test::FailingDisk;
        use alloc::boxed::Box;

        let pool = SwapPool::new(0, 1);
        let mut disk = Block::new("broken", 64, Box::new(FailingDisk));
        let page = vec![0u8; PAGE_FRAME_SIZE];
        assert_eq!(
            pool.write_slot(&mut disk, 0, &page),
            Err(SwapError::Io(BlockError::DeviceFault))
        );
    }
}
