//! The page-table seam the pager drives.
//!
//! The real MMU-facing implementation lives with the boot and trap layers;
//! the fault path only needs the handful of operations in [`PageTable`].
//! [`TempPageTable`] emulates one over a bounded pool of kernel-memory
//! frames so the whole fault pipeline runs in host tests.

#![allow(clippy::cast_possible_truncation)]

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use arbitrary_int::u20;
use bitbybit::bitfield;
use core::fmt;
use medulla_shared::mem::{is_page_aligned, page_round_down, PAGE_FRAME_SIZE};
use medulla_shared::paging::PageTableEntry;

/// Permissions for a user mapping.
///
/// Readable is implied; a mapping that exists can always be read by its
/// owning process.
#[bitfield(u8, default = 0)]
#[derive(Debug)]
pub struct MapPerm {
    #[bit(0, rw)]
    writable: bool,
    #[bit(1, rw)]
    executable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame available.
    OutOfFrames,
    /// The address already has a mapping.
    AlreadyMapped,
    /// The address has no mapping.
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::AlreadyMapped => write!(f, "address already mapped"),
            Self::NotMapped => write!(f, "address not mapped"),
        }
    }
}

impl core::error::Error for MapError {}

/// Operations the fault path needs from a process's page table.
pub trait PageTable {
    /// Map `pages` fresh frames starting at page-aligned `vaddr`.
    ///
    /// New frames are zero-filled so a recycled frame never exposes a
    /// previous owner's bytes.
    fn map(&mut self, vaddr: usize, pages: usize, perm: MapPerm) -> Result<(), MapError>;

    /// Drop the mappings starting at page-aligned `vaddr` and release
    /// their frames.
    fn unmap(&mut self, vaddr: usize, pages: usize);

    /// Copy `bytes` into mapped user memory at `vaddr`.
    fn copy_out(&mut self, vaddr: usize, bytes: &[u8]) -> Result<(), MapError>;

    /// Copy mapped user memory at `vaddr` into `buf`.
    fn copy_in(&self, vaddr: usize, buf: &mut [u8]) -> Result<(), MapError>;

    fn is_mapped(&self, vaddr: usize) -> bool;
}

/// A page table emulated over a bounded pool of kernel-memory frames.
pub struct TempPageTable {
    frames: Vec<Option<Box<[u8; PAGE_FRAME_SIZE]>>>,
    entries: BTreeMap<usize, PageTableEntry>,
}

impl TempPageTable {
    /// A table backed by at most `max_frames` physical frames.
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: (0..max_frames).map(|_| None).collect(),
            entries: BTreeMap::new(),
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    /// The raw entry for `vaddr`, if mapped.
    pub fn entry(&self, vaddr: usize) -> Option<PageTableEntry> {
        self.entries.get(&page_round_down(vaddr)).copied()
    }

    fn frame_alloc(&mut self) -> Option<usize> {
        let index = self.frames.iter().position(Option::is_none)?;
        self.frames[index] = Some(Box::new([0; PAGE_FRAME_SIZE]));
        Some(index)
    }
}

impl PageTable for TempPageTable {
    fn map(&mut self, vaddr: usize, pages: usize, perm: MapPerm) -> Result<(), MapError> {
        debug_assert!(is_page_aligned(vaddr));

        for i in 0..pages {
            if self.entries.contains_key(&(vaddr + i * PAGE_FRAME_SIZE)) {
                return Err(MapError::AlreadyMapped);
            }
        }

        for i in 0..pages {
            let Some(frame) = self.frame_alloc() else {
                // Roll the partial mapping back so a failed map has no
                // side effects.
                self.unmap(vaddr, i);
                return Err(MapError::OutOfFrames);
            };
            let pte = PageTableEntry::DEFAULT
                .with_present(true)
                .with_read_write(perm.writable())
                .with_user_supervisor(true)
                .with_frame(u20::new(frame as u32));
            self.entries.insert(vaddr + i * PAGE_FRAME_SIZE, pte);
        }
        Ok(())
    }

    fn unmap(&mut self, vaddr: usize, pages: usize) {
        debug_assert!(is_page_aligned(vaddr));
        for i in 0..pages {
            let page = vaddr + i * PAGE_FRAME_SIZE;
            let Some(pte) = self.entries.remove(&page) else {
                debug_assert!(false, "unmap of unmapped page");
                continue;
            };
            self.frames[pte.frame_number()] = None;
        }
    }

    fn copy_out(&mut self, vaddr: usize, bytes: &[u8]) -> Result<(), MapError> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < bytes.len() {
            let page = page_round_down(addr);
            let offset = addr - page;
            let count = (PAGE_FRAME_SIZE - offset).min(bytes.len() - done);

            let pte = *self.entries.get(&page).ok_or(MapError::NotMapped)?;
            self.entries
                .insert(page, pte.with_accessed(true).with_dirty(true));
            let frame = self.frames[pte.frame_number()]
                .as_mut()
                .ok_or(MapError::NotMapped)?;
            frame[offset..offset + count].copy_from_slice(&bytes[done..done + count]);

            addr = page + PAGE_FRAME_SIZE;
            done += count;
        }
        Ok(())
    }

    fn copy_in(&self, vaddr: usize, buf: &mut [u8]) -> Result<(), MapError> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let page = page_round_down(addr);
            let offset = addr - page;
            let count = (PAGE_FRAME_SIZE - offset).min(buf.len() - done);

            let pte = self.entries.get(&page).ok_or(MapError::NotMapped)?;
            let frame = self.frames[pte.frame_number()]
                .as_ref()
                .ok_or(MapError::NotMapped)?;
            buf[done..done + count].copy_from_slice(&frame[offset..offset + count]);

            addr = page + PAGE_FRAME_SIZE;
            done += count;
        }
        Ok(())
    }

    fn is_mapped(&self, vaddr: usize) -> bool {
        self.entries.contains_key(&page_round_down(vaddr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_map_zero_fills() {
        let mut pt = TempPageTable::new(2);
        pt.map(0x1000, 1, MapPerm::DEFAULT).unwrap();

        let mut buf = vec![0xFF; PAGE_FRAME_SIZE];
        pt.copy_in(0x1000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_roundtrip_across_pages() {
        let mut pt = TempPageTable::new(2);
        pt.map(0x1000, 2, MapPerm::DEFAULT.with_writable(true))
            .unwrap();

        let bytes: Vec<u8> = (0..PAGE_FRAME_SIZE + 100).map(|i| i as u8).collect();
        pt.copy_out(0x1800, &bytes).unwrap();
        let mut back = vec![0; bytes.len()];
        pt.copy_in(0x1800, &mut back).unwrap();
        assert_eq!(back, bytes);
    }

    #[test]
    fn test_unmap_releases_frame() {
        let mut pt = TempPageTable::new(1);
        pt.map(0x1000, 1, MapPerm::DEFAULT).unwrap();
        assert_eq!(pt.map(0x2000, 1, MapPerm::DEFAULT), Err(MapError::OutOfFrames));

        pt.unmap(0x1000, 1);
        assert_eq!(pt.frames_in_use(), 0);
        pt.map(0x2000, 1, MapPerm::DEFAULT).unwrap();
        assert!(pt.is_mapped(0x2000));
        assert!(!pt.is_mapped(0x1000));
    }

    #[test]
    fn test_double_map_rejected() {
        let mut pt = TempPageTable::new(4);
        pt.map(0x3000, 1, MapPerm::DEFAULT).unwrap();
        assert_eq!(
            pt.map(0x3000, 1, MapPerm::DEFAULT),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn test_copy_to_unmapped_fails() {
        let mut pt = TempPageTable::new(1);
        assert_eq!(pt.copy_out(0x4000, &[1, 2, 3]), Err(MapError::NotMapped));
        let mut buf = [0; 4];
        assert_eq!(pt.copy_in(0x4000, &mut buf), Err(MapError::NotMapped));
    }

    #[test]
    fn test_permissions_reach_the_entry() {
        let mut pt = TempPageTable::new(2);
        pt.map(0x1000, 1, MapPerm::DEFAULT.with_writable(true))
            .unwrap();
        pt.map(0x2000, 1, MapPerm::DEFAULT).unwrap();

        let writable = pt.entry(0x1000).unwrap();
        assert!(writable.present() && writable.read_write() && writable.user_supervisor());
        let read_only = pt.entry(0x2000).unwrap();
        assert!(read_only.present() && !read_only.read_write());
    }

    #[test]
    fn test_failed_multi_page_map_rolls_back() {
        let mut pt = TempPageTable::new(1);
        assert_eq!(
            pt.map(0x1000, 2, MapPerm::DEFAULT),
            Err(MapError::OutOfFrames)
        );
        assert_eq!(pt.mapped_pages(), 0);
        assert_eq!(pt.frames_in_use(), 0);
    }
}
