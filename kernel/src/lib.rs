//! Demand paging and heap swapping for user processes.
//!
//! The trap-dispatch layer hands every user page fault to
//! [`mem::fault::page_fault`]; everything below that entry point — image
//! page loading, heap residency tracking, victim selection, swap-slot
//! management — lives in this crate. Page tables, block devices, the
//! executable image, and the tick source are consumed through the seams in
//! [`paging`], [`block`], [`fs`], and [`timer`].

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod threading;
pub mod timer;
pub mod user_program;

pub use mem::fault::{handle_page_fault, page_fault, FaultContext, FaultError, FaultOutcome};
