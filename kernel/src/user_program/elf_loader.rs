//! The image-region half of fault handling: locate the loadable segment
//! containing a faulting address and bring that one page in from the
//! executable image.
//!
//! Image pages always get a fresh frame and are never evicted; the heap
//! tracker and swap pool are untouched on this path.

#![allow(clippy::cast_possible_truncation)]

use super::elf::{
    ElfHeader, ElfProgramHeader, ElfProgramType, ELF_HEADER_SIZE, PROGRAM_HEADER_SIZE,
};
use crate::fs::{self, ImageFile};
use crate::paging::{MapError, MapPerm, PageTable};
use alloc::vec;
use core::fmt;
use medulla_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};

/// Inconsistencies in a loadable segment's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    MemSizeLessThanFileSize,
    AddressWrapAround,
    UnalignedStart,
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MemSizeLessThanFileSize => write!(f, "memory size below file size"),
            Self::AddressWrapAround => write!(f, "segment wraps the address space"),
            Self::UnalignedStart => write!(f, "segment start not page aligned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The image is not a well-formed 32-bit executable.
    BadHeader,
    /// A loadable segment's metadata is inconsistent.
    Segment(SegmentError),
    /// No loadable segment contains the faulting address.
    NoSegmentForAddress,
    Io(fs::Error),
    Map(MapError),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadHeader => write!(f, "malformed image header"),
            Self::Segment(err) => write!(f, "malformed segment: {err}"),
            Self::NoSegmentForAddress => write!(f, "no segment for address"),
            Self::Io(err) => write!(f, "image read failed: {err}"),
            Self::Map(err) => write!(f, "mapping failed: {err}"),
        }
    }
}

impl core::error::Error for ImageError {}

/// Where and with which permissions an image page was installed.
#[derive(Debug, Clone, Copy)]
pub struct LoadedPage {
    pub vaddr: usize,
    pub perm: MapPerm,
}

fn segment_perm(ph: &ElfProgramHeader) -> MapPerm {
    MapPerm::DEFAULT
        .with_writable(ph.writable)
        .with_executable(ph.executable)
}

fn validate_segment(ph: &ElfProgramHeader) -> Result<(), SegmentError> {
    // p_memsz must be at least as big as p_filesz.
    if ph.memory_size < ph.file_size {
        return Err(SegmentError::MemSizeLessThanFileSize);
    }

    // The region cannot wrap around the top of the address space.
    if ph.virtual_address.checked_add(ph.memory_size).is_none() {
        return Err(SegmentError::AddressWrapAround);
    }

    if !is_page_aligned(ph.virtual_address as usize) {
        return Err(SegmentError::UnalignedStart);
    }

    Ok(())
}

/// Resolve a fault inside the image region.
///
/// Scans the program-header table in file order; the first `Load` segment
/// containing `fault_addr` is authoritative. One frame is mapped at the
/// (page-aligned) faulting address and filled with `PAGE_FRAME_SIZE`
/// bytes of image contents from the segment's file offset; a short read
/// near the end of the image leaves the zero fill in place. Validation
/// failures abort before anything is mapped.
pub fn load_image_page(
    image: &mut dyn ImageFile,
    pagetable: &mut dyn PageTable,
    fault_addr: usize,
) -> Result<LoadedPage, ImageError> {
    debug_assert!(is_page_aligned(fault_addr));

    let mut ehdr = [0u8; ELF_HEADER_SIZE];
    if image.read_at(0, &mut ehdr).map_err(ImageError::Io)? != ELF_HEADER_SIZE {
        return Err(ImageError::BadHeader);
    }
    let header = ElfHeader::parse_bytes(&ehdr).map_err(|_| ImageError::BadHeader)?;

    let entry_size = header.program_header_entry_size as usize;
    if entry_size < PROGRAM_HEADER_SIZE {
        return Err(ImageError::BadHeader);
    }
    let table_len = entry_size * header.program_header_count as usize;
    let mut table = vec![0u8; table_len];
    let read = image
        .read_at(u64::from(header.program_headers_offset), &mut table)
        .map_err(ImageError::Io)?;
    if read != table_len {
        return Err(ImageError::BadHeader);
    }
    let headers = ElfProgramHeader::parse_table(
        &table,
        header.endianness,
        header.program_header_count as usize,
        entry_size,
    )
    .map_err(|_| ImageError::BadHeader)?;

    for ph in &headers {
        if ph.program_type != ElfProgramType::Load {
            continue;
        }
        validate_segment(ph).map_err(ImageError::Segment)?;

        let start = ph.virtual_address as usize;
        let end = start + ph.memory_size as usize;
        if fault_addr < start || fault_addr >= end {
            continue;
        }

        let perm = segment_perm(ph);
        pagetable.map(fault_addr, 1, perm).map_err(ImageError::Map)?;

        let mut page = vec![0u8; PAGE_FRAME_SIZE];
        let offset = u64::from(ph.file_offset) + (fault_addr - start) as u64;
        if let Err(err) = image.read_at(offset, &mut page) {
            pagetable.unmap(fault_addr, 1);
            return Err(ImageError::Io(err));
        }
        if let Err(err) = pagetable.copy_out(fault_addr, &page) {
            pagetable.unmap(fault_addr, 1);
            return Err(ImageError::Map(err));
        }

        return Ok(LoadedPage {
            vaddr: fault_addr,
            perm,
        });
    }

    Err(ImageError::NoSegmentForAddress)
}
