//! Frame allocators for the unit tests, backed by leaked host arenas.
//!
//! Each `test_arena!` invocation declares a fresh retriever type with its
//! own arena, so tests that assert exact freelist counts don't observe
//! each other's allocations.

use std::{alloc, sync::Mutex};

use frame_alloc::FrameAllocator;

use crate::PAGE_SIZE;

pub(crate) fn new_allocator(pages: usize) -> Mutex<FrameAllocator<PAGE_SIZE>> {
    let layout = alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let start = unsafe { alloc::alloc(layout) };
    assert!(!start.is_null());
    let range = start..unsafe { start.byte_add(pages * PAGE_SIZE) };
    Mutex::new(unsafe { FrameAllocator::new(range) })
}

/// Declares a [`frame_alloc::RetrieveFrameAllocator`] type named `$name`
/// over a dedicated arena of `$pages` frames.
macro_rules! test_arena {
    ($name:ident, $pages:expr) => {
        enum $name {}

        impl ::frame_alloc::RetrieveFrameAllocator<{ $crate::PAGE_SIZE }> for $name {
            type AllocatorRef = ::std::sync::MutexGuard<
                'static,
                ::frame_alloc::FrameAllocator<{ $crate::PAGE_SIZE }>,
            >;

            fn retrieve() -> Self::AllocatorRef {
                static ALLOCATOR: ::std::sync::OnceLock<
                    ::std::sync::Mutex<::frame_alloc::FrameAllocator<{ $crate::PAGE_SIZE }>>,
                > = ::std::sync::OnceLock::new();
                ALLOCATOR
                    .get_or_init(|| $crate::test_arena::new_allocator($pages))
                    .lock()
                    .unwrap()
            }
        }
    };
}

pub(crate) use test_arena;
