//! Sv39 three-level page tables and user address spaces.
//!
//! The engine is machine-independent: it reads and writes page-table
//! frames through ordinary pointers and obtains those frames from a
//! [`frame_alloc::RetrieveFrameAllocator`] supplied as a type parameter.
//! The kernel instantiates it over its physical page allocator, where
//! physical addresses and kernel virtual addresses coincide; the unit
//! tests instantiate it over host arenas, which satisfies the same
//! identity assumption.

#![cfg_attr(not(test), no_std)]

pub use self::{
    addr::{PageRound, PhysAddr, PhysPageNum, VirtAddr},
    error::Error,
    page_table::{PageTable, PtEntryFlags},
    user::UserAddressSpace,
};

/// Bytes per page
pub const PAGE_SIZE: usize = 4096;

/// Bits of offset within a page
pub const PAGE_SHIFT: usize = 12;

/// Every address space maps the trampoline page at the highest virtual
/// address; a process's trap frame sits just below it.
pub const TRAMPOLINE: VirtAddr = VirtAddr::MAX.byte_sub(PAGE_SIZE);

pub const TRAPFRAME: VirtAddr = TRAMPOLINE.byte_sub(PAGE_SIZE);

mod addr;
mod error;
mod page_table;
mod user;

#[cfg(test)]
pub(crate) mod test_arena;
