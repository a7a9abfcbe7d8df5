//! Generic page fault handling for user processes.
//!
//! The trap dispatcher calls [`page_fault`] with the faulting address; the
//! fault either resolves (the process resumes at the same instruction and
//! never observes the work done here) or the process is killed. Addresses
//! below the image boundary are satisfied from the executable image;
//! addresses above it belong to the heap and go through admission control,
//! eviction, and the swap pool as needed.

use crate::block::{Block, BlockError};
use crate::fs::{self, ImageFile};
use crate::mem::heap_tracker::{HeapError, Residency};
use crate::paging::{MapError, MapPerm, PageTable};
use crate::swapping::page_replacement::PageReplacementPolicy;
use crate::swapping::{SwapError, SwapPool, SwapSlot};
use crate::threading::process::Process;
use crate::timer::Clock;
use crate::user_program::elf_loader::{self, ImageError};
use alloc::vec;
use core::fmt;
use medulla_shared::mem::{page_round_down, PAGE_FRAME_SIZE, USER_MEMORY_TOP};
use medulla_shared::{eprintln, println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The executable image's metadata is inconsistent.
    MalformedImage,
    /// The process is out of heap-tracker entries.
    CapacityExceeded,
    /// No free swap slot at eviction time.
    PoolExhausted,
    /// The address belongs to no region this process may touch.
    UnresolvedFault,
    /// A page-table operation failed.
    Map(MapError),
    /// The swap device failed a transfer.
    Io(BlockError),
    /// The executable image could not be read.
    Image(fs::Error),
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedImage => write!(f, "malformed executable image"),
            Self::CapacityExceeded => write!(f, "heap page table full"),
            Self::PoolExhausted => write!(f, "swap pool exhausted"),
            Self::UnresolvedFault => write!(f, "address outside every region"),
            Self::Map(err) => write!(f, "page table: {err}"),
            Self::Io(err) => write!(f, "swap i/o: {err}"),
            Self::Image(err) => write!(f, "image: {err}"),
        }
    }
}

impl core::error::Error for FaultError {}

impl From<SwapError> for FaultError {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::PoolExhausted => Self::PoolExhausted,
            SwapError::Io(err) => Self::Io(err),
        }
    }
}

impl From<ImageError> for FaultError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::BadHeader | ImageError::Segment(_) => Self::MalformedImage,
            ImageError::NoSegmentForAddress => Self::UnresolvedFault,
            ImageError::Io(err) => Self::Image(err),
            ImageError::Map(err) => Self::Map(err),
        }
    }
}

impl From<HeapError> for FaultError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::CapacityExceeded => Self::CapacityExceeded,
        }
    }
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A page of the executable image was loaded.
    ImagePageLoaded { vaddr: usize },
    /// A heap page was faulted into existence for the first time.
    HeapPageCreated { vaddr: usize },
    /// A previously evicted heap page was brought back from swap.
    HeapPageReloaded { vaddr: usize },
    /// Spurious fault: the page was already resident. Nothing changed.
    AlreadyResident { vaddr: usize },
}

/// Everything a fault needs besides the process itself.
///
/// All state is passed by reference: the swap pool and clock are shared
/// kernel objects, the page table and image belong to the faulting
/// process, and exclusive access to the process's address-space state is
/// the caller's (the trap layer's) responsibility.
pub struct FaultContext<'a> {
    pub pagetable: &'a mut dyn PageTable,
    pub image: &'a mut dyn ImageFile,
    pub swap_pool: &'a SwapPool,
    pub swap_device: &'a mut Block,
    pub policy: &'a mut dyn PageReplacementPolicy,
    pub clock: &'a Clock,
}

/// Trap-dispatch entry point. Resolves the fault or kills the process.
pub fn page_fault(process: &mut Process, ctx: &mut FaultContext, fault_addr: usize) {
    if let Err(err) = handle_page_fault(process, ctx, fault_addr) {
        eprintln!(
            "[{}] unrecoverable page fault at {:#x}: {}",
            process.name, fault_addr, err
        );
        process.kill();
    }
}

/// Classify and resolve one page fault.
pub fn handle_page_fault(
    process: &mut Process,
    ctx: &mut FaultContext,
    fault_addr: usize,
) -> Result<FaultOutcome, FaultError> {
    let fault_page = page_round_down(fault_addr);

    if fault_page < process.image_top() {
        // A page of the program binary that we must load.
        let loaded = elf_loader::load_image_page(ctx.image, ctx.pagetable, fault_page)?;
        println!(
            "[{}] loaded image page {:#x}..{:#x}",
            process.name,
            loaded.vaddr,
            loaded.vaddr + PAGE_FRAME_SIZE
        );
        return Ok(FaultOutcome::ImagePageLoaded { vaddr: loaded.vaddr });
    }

    match process.heap.lookup(fault_page) {
        Some(index) => match process.heap.page(index).state() {
            Residency::Resident => Ok(FaultOutcome::AlreadyResident { vaddr: fault_page }),
            Residency::Swapped(slot) => reload_heap_page(process, ctx, index, slot, fault_page),
            // A tracked page with no frame yet: give it its first one.
            Residency::NeverLoaded => admit_heap_page(process, ctx, index, fault_page),
        },
        None => new_heap_page(process, ctx, fault_page),
    }
}

/// First-ever touch of a heap address: track it, then admit it.
fn new_heap_page(
    process: &mut Process,
    ctx: &mut FaultContext,
    vaddr: usize,
) -> Result<FaultOutcome, FaultError> {
    if vaddr >= USER_MEMORY_TOP {
        return Err(FaultError::UnresolvedFault);
    }

    let index = process.heap.create(vaddr)?;
    admit_heap_page(process, ctx, index, vaddr)
}

/// Map a fresh zero-filled heap page at `vaddr`, evicting first if the
/// process is at its residency limit.
fn admit_heap_page(
    process: &mut Process,
    ctx: &mut FaultContext,
    index: usize,
    vaddr: usize,
) -> Result<FaultOutcome, FaultError> {
    if process.heap.at_admission_limit() {
        evict_page_to_disk(process, ctx)?;
    }

    ctx.pagetable
        .map(vaddr, 1, MapPerm::DEFAULT.with_writable(true))
        .map_err(FaultError::Map)?;
    if vaddr >= process.heap_ceiling() {
        process.extend_heap_ceiling(vaddr + PAGE_FRAME_SIZE);
    }
    process.heap.mark_resident(index, ctx.clock.now());

    println!("[{}] mapped heap page at {:#x}", process.name, vaddr);
    Ok(FaultOutcome::HeapPageCreated { vaddr })
}

/// Re-fault on a swapped-out heap page: bring the contents back from the
/// swap area and release the slot.
fn reload_heap_page(
    process: &mut Process,
    ctx: &mut FaultContext,
    index: usize,
    slot: SwapSlot,
    vaddr: usize,
) -> Result<FaultOutcome, FaultError> {
    // Secure the contents in kernel memory and give the slot back before
    // admission control runs, so a fully occupied pool can hand this very
    // slot to the victim this re-fault forces out.
    let mut page = vec![0u8; PAGE_FRAME_SIZE];
    ctx.swap_pool.read_slot(ctx.swap_device, slot, &mut page)?;
    ctx.swap_pool.free(slot);

    if process.heap.at_admission_limit() {
        evict_page_to_disk(process, ctx)?;
    }

    ctx.pagetable
        .map(vaddr, 1, MapPerm::DEFAULT.with_writable(true))
        .map_err(FaultError::Map)?;
    if let Err(err) = ctx.pagetable.copy_out(vaddr, &page) {
        ctx.pagetable.unmap(vaddr, 1);
        return Err(FaultError::Map(err));
    }

    process.heap.mark_resident(index, ctx.clock.now());

    println!(
        "[{}] retrieved heap page at {:#x} from swap slot {}",
        process.name, vaddr, slot
    );
    Ok(FaultOutcome::HeapPageReloaded { vaddr })
}

/// Evict one resident heap page to the swap area.
///
/// The victim's contents are on the device before its frame is released
/// or its slot could be seen by anyone else; on failure the reserved slot
/// is returned to the pool so it never leaks.
fn evict_page_to_disk(process: &mut Process, ctx: &mut FaultContext) -> Result<(), FaultError> {
    let victim = ctx
        .policy
        .select_victim(process.heap.pages())
        .expect("a page is resident when the admission limit is hit");
    let vaddr = process.heap.page(victim).vaddr();

    let slot = ctx.swap_pool.allocate()?;

    // Read the page out of user memory, then persist it.
    let mut page = vec![0u8; PAGE_FRAME_SIZE];
    let persisted = ctx
        .pagetable
        .copy_in(vaddr, &mut page)
        .map_err(FaultError::Map)
        .and_then(|()| {
            ctx.swap_pool
                .write_slot(ctx.swap_device, slot, &page)
                .map_err(FaultError::from)
        });
    if let Err(err) = persisted {
        ctx.swap_pool.free(slot);
        return Err(err);
    }

    ctx.pagetable.unmap(vaddr, 1);
    process.heap.mark_swapped(victim, slot);

    println!(
        "[{}] evicted heap page at {:#x} to swap slot {}",
        process.name, vaddr, slot
    );
    Ok(())
}
