//! Physical memory allocator, for user processes,
//! kernel stacks and page-table pages.
//!
//! Allocates whole 4096-byte pages from the RAM between the end of the
//! kernel image and `PHYS_TOP`.

use core::ptr::{self, NonNull};

use frame_alloc::{FrameAllocator, RetrieveFrameAllocator};
use once_slot::OnceSlot;
use sv39::PAGE_SIZE;

use crate::{
    memory::layout::{KERNEL_END, PHYS_TOP},
    sync::{SpinLock, SpinLockGuard},
};

static ALLOCATOR: OnceSlot<SpinLock<FrameAllocator<PAGE_SIZE>>> = OnceSlot::new();

/// Hands page-table code and address spaces access to the one global
/// allocator.
pub struct FrameSource;

impl RetrieveFrameAllocator<PAGE_SIZE> for FrameSource {
    type AllocatorRef = SpinLockGuard<'static, FrameAllocator<PAGE_SIZE>>;

    fn retrieve() -> Self::AllocatorRef {
        ALLOCATOR.get().lock()
    }
}

/// Gives all remaining RAM to the allocator. Called once by the primary
/// hart; a second call panics.
pub fn init() {
    let region = unsafe {
        ptr::with_exposed_provenance_mut::<u8>(KERNEL_END)
            ..ptr::with_exposed_provenance_mut::<u8>(PHYS_TOP)
    };
    ALLOCATOR.set(SpinLock::new(unsafe { FrameAllocator::new(region) }));
}

/// Allocates one 4096-byte page of physical memory.
///
/// Returns `None` if the memory cannot be allocated.
pub fn alloc_page() -> Option<NonNull<u8>> {
    ALLOCATOR.get().lock().alloc()
}

/// Allocates one 4096-byte zeroed page of physical memory.
///
/// Returns `None` if the memory cannot be allocated.
pub fn alloc_zeroed_page() -> Option<NonNull<u8>> {
    ALLOCATOR.get().lock().alloc_zeroed()
}

/// Frees the page of physical memory pointed at by `pa`,
/// which normally should have been returned by a
/// call to [`alloc_page`].
pub unsafe fn free_page(pa: NonNull<u8>) {
    unsafe { ALLOCATOR.get().lock().free(pa) }
}

/// Number of pages currently free.
pub fn free_page_count() -> usize {
    ALLOCATOR.get().lock().free_count()
}
