use core::{marker::PhantomData, ops::Range, ptr, ptr::NonNull};

use bitflags::bitflags;
use frame_alloc::RetrieveFrameAllocator;

use crate::{
    PAGE_SHIFT, PAGE_SIZE,
    addr::{PageRound as _, PhysAddr, PhysPageNum, VirtAddr, page_rounddown},
    error::Error,
};

/// A single level of an Sv39 page table: one frame holding 512 entries.
///
/// Interior tables are owned by the tables above them through valid
/// non-leaf entries; the root owns the whole tree. `R` names the frame
/// allocator the tree draws its pages from.
#[repr(transparent)]
pub struct PageTable<R> {
    entries: [PtEntry; 512],
    _frames: PhantomData<R>,
}

impl<R> PageTable<R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    /// Allocates a new empty page table.
    pub fn try_allocate() -> Result<NonNull<Self>, Error> {
        let frame = R::retrieve().alloc_zeroed().ok_or(Error::NoFreeFrame)?;
        Ok(frame.cast())
    }

    /// Returns the page table index that corresponds to virtual address `va`
    ///
    /// The RISC-V Sv39 schema has three levels of page-table
    /// pages. A page-table page contains 512 64-bit PTEs.
    /// A 64-bit virtual address is split into five fields:
    /// ```text
    ///     39..=63 -- must be zero.
    ///     30..=38 -- 9 bits of level-2 index.
    ///     21..=29 -- 9 bits of level-1 index.
    ///     12..=20 -- 9 bits of level-0 index.
    ///      0..=11 -- 12 bits byte offset with the page.
    /// ```
    fn entry_index(level: usize, va: VirtAddr) -> usize {
        assert!(level <= 2);
        let shift = PAGE_SHIFT + (9 * level);
        (va.addr() >> shift) & 0x1ff
    }

    /// Returns the physical address of the frame containing this table.
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(ptr::from_ref(self).expose_provenance())
    }

    /// Returns the physical page number of the frame containing this table.
    pub fn phys_page_num(&self) -> PhysPageNum {
        self.phys_addr().phys_page_num()
    }

    /// Creates a PTE for virtual address `va` that refers to
    /// physical address `pa`.
    ///
    /// `va` MUST be page-aligned, `perm` must carry at least one of
    /// `R`/`W`/`X` and must not carry `V`.
    ///
    /// Returns `Err` if a needed page-table page couldn't be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `va` is already mapped.
    pub fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, perm: PtEntryFlags) -> Result<(), Error> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");
        assert!(!perm.contains(PtEntryFlags::V), "perm={perm:?}");

        self.update_level0_entry(va, true, |pte| {
            assert!(!pte.is_valid(), "remap of a mapped address: va={va:#x}");
            pte.set_phys_addr(pa, perm | PtEntryFlags::V);
        })
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`.
    ///
    /// Neither `va` nor `len` need be page-aligned: the mapping covers
    /// exactly the pages the byte range `[va, va + len)` touches.
    ///
    /// Returns `Err` if a needed page-table page couldn't be allocated.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        len: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), Error> {
        assert_ne!(len, 0, "len={len:#x}");

        let last = VirtAddr::new(page_rounddown(va.addr() + len - 1));
        let mut va = va.page_rounddown();
        let mut pa = pa;
        loop {
            self.map_page(va, pa, perm)?;
            if va == last {
                return Ok(());
            }

            va = va.byte_add(PAGE_SIZE);
            pa = pa.byte_add(PAGE_SIZE);
        }
    }

    /// Unmaps the page of memory at virtual address `va`.
    ///
    /// Returns the physical address of the frame that was mapped there;
    /// the caller decides whether to free it.
    ///
    /// # Panics
    ///
    /// Panics if `va` is not page-aligned, is not mapped, or its entry is
    /// not a leaf (an entry whose flag field is exactly `V` is an interior
    /// table sitting where a leaf was expected).
    pub(crate) fn unmap_page(&mut self, va: VirtAddr) -> PhysAddr {
        assert!(va.is_page_aligned(), "va={va:#x}");

        self.update_level0_entry(va, false, |pte| {
            assert!(pte.is_valid(), "unmap of an unmapped address: va={va:#x}");
            assert!(pte.is_leaf(), "unmap of a non-leaf entry: va={va:#x}");
            let pa = pte.phys_addr();
            pte.clear();
            pa
        })
        .unwrap_or_else(|_| panic!("unmap of an unmapped address: va={va:#x}"))
    }

    /// Unmaps the `npages` pages of memory starting at virtual address
    /// `va`, yielding each unmapped frame.
    ///
    /// The returned iterator finishes the unmapping even when dropped
    /// before being exhausted.
    pub(crate) fn unmap_pages(&mut self, va: VirtAddr, npages: usize) -> UnmapPages<'_, R> {
        UnmapPages {
            pt: self,
            va,
            offsets: 0..npages,
        }
    }

    /// Returns the leaf PTE in the page tables that corresponds to virtual
    /// address `va`.
    pub(crate) fn find_leaf_entry(&self, va: VirtAddr) -> Result<&PtEntry, Error> {
        if va >= VirtAddr::MAX {
            return Err(Error::AddressNotMapped(va));
        }

        let mut pt = self;
        for level in (1..=2).rev() {
            let pte = &pt.entries[Self::entry_index(level, va)];
            if !pte.is_valid() {
                return Err(Error::AddressNotMapped(va));
            }
            assert!(pte.is_non_leaf());
            pt = unsafe { pte.phys_addr().as_ptr::<Self>().as_ref().unwrap() };
        }

        let pte = &pt.entries[Self::entry_index(0, va)];
        if !pte.is_leaf() {
            return Err(Error::AddressNotMapped(va));
        }
        Ok(pte)
    }

    /// Updates the level-0 PTE in the page tables that corresponds to
    /// virtual address `va`.
    ///
    /// If `insert_new_table` is `true`, missing interior tables are
    /// allocated and zeroed along the way; otherwise a missing table makes
    /// the walk fail. The updated PTE must be left leaf or invalid.
    ///
    /// # Panics
    ///
    /// Panics if `va` is at or above [`VirtAddr::MAX`]; addresses that
    /// reach this walk come from the kernel, so an out-of-range one is a
    /// kernel bug.
    pub(crate) fn update_level0_entry<T, F>(
        &mut self,
        va: VirtAddr,
        insert_new_table: bool,
        f: F,
    ) -> Result<T, Error>
    where
        F: for<'a> FnOnce(&'a mut PtEntry) -> T,
    {
        assert!(va < VirtAddr::MAX, "va={va:#x}");

        unsafe {
            let mut pt = NonNull::from(&mut *self);
            for level in (1..=2).rev() {
                let index = Self::entry_index(level, va);
                let pte = &mut pt.as_mut().entries[index];
                if pte.is_valid() {
                    assert!(pte.is_non_leaf());
                    pt = pte.phys_addr().as_mut_ptr();
                    continue;
                }

                if !insert_new_table {
                    return Err(Error::AddressNotMapped(va));
                }

                pt = Self::try_allocate()?;
                *pte = PtEntry::new(pt.as_ref().phys_page_num(), PtEntryFlags::V);
            }

            let index = Self::entry_index(0, va);
            let pte = &mut pt.as_mut().entries[index];
            let res = f(pte);
            // level-0 entries must stay leaf or invalid
            assert!(!pte.is_non_leaf());
            Ok(res)
        }
    }

    /// Looks up a virtual address and returns the physical address of the
    /// mapped frame, requiring the leaf to carry all of `flags`.
    pub fn resolve_virtual_address(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<PhysAddr, Error> {
        let pte = self.find_leaf_entry(va)?;
        if !pte.flags().contains(flags) {
            return Err(Error::InaccessibleMemory(va));
        }

        Ok(pte.phys_addr())
    }

    /// Fetches the page that is mapped at virtual address `va`.
    pub(crate) fn fetch_page(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8; PAGE_SIZE], Error> {
        let pa = self.resolve_virtual_address(va, flags)?;
        let page = unsafe { pa.as_mut_ptr::<[u8; PAGE_SIZE]>().as_ref() };
        Ok(page)
    }

    /// Fetches the page that is mapped at virtual address `va`, mutably.
    pub(crate) fn fetch_page_mut(
        &mut self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&mut [u8; PAGE_SIZE], Error> {
        let pa = self.resolve_virtual_address(va, flags)?;
        let page = unsafe { pa.as_mut_ptr::<[u8; PAGE_SIZE]>().as_mut() };
        Ok(page)
    }

    /// Recursively frees interior page-table pages, leaving this table
    /// empty. The table's own frame stays allocated; the owner frees it.
    ///
    /// # Panics
    ///
    /// Panics if a leaf mapping is still present anywhere in the tree.
    pub(crate) fn free_descendant(&mut self) {
        for pte in &mut self.entries {
            if !pte.is_valid() {
                continue;
            }
            assert!(pte.is_non_leaf(), "leaf mapping survived to table teardown");
            let mut child = pte.phys_addr().as_mut_ptr::<Self>();
            unsafe {
                child.as_mut().free_descendant();
                R::retrieve().free(child.cast());
            }
            pte.clear();
        }
    }
}

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Valid Bit of page table entry.
        ///
        /// If set, an entry for this virtual address exists.
        const V = 1 << 0;

        /// Read Bit of page table entry.
        ///
        /// If set, the CPU can read to this virtual address.
        const R = 1 << 1;

        /// Write Bit of page table entry.
        ///
        /// If set, the CPU can write to this virtual address.
        const W = 1 << 2;

        /// Executable Bit of page table entry.
        ///
        /// If set, the CPU can executes the instructions on this virtual address.
        const X = 1 << 3;

        /// UserMode Bit of page table entry.
        ///
        /// If set, userspace can access this virtual address.
        const U = 1 << 4;

        /// Global Mapping Bit of page table entry.
        ///
        /// If set, this virtual address exists in all address spaces.
        const G = 1 << 5;

        /// Access Bit of page table entry.
        ///
        /// If set, this virtual address have been accesses.
        const A = 1 << 6;

        /// Dirty Bit of page table entry.
        ///
        /// If set, this virtual address have been written.
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URX = Self::U.bits() | Self::RX.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

pub(crate) struct UnmapPages<'a, R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    pt: &'a mut PageTable<R>,
    va: VirtAddr,
    offsets: Range<usize>,
}

impl<R> Iterator for UnmapPages<'_, R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    type Item = PhysAddr;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.offsets.next()?;
        let va = self.va.byte_add(i * PAGE_SIZE);
        Some(self.pt.unmap_page(va))
    }
}

impl<R> Drop for UnmapPages<'_, R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    fn drop(&mut self) {
        for _ in self {}
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub(crate) struct PtEntry(usize);

impl PtEntry {
    const FLAGS_MASK: usize = 0x3FF;

    fn new(ppn: PhysPageNum, flags: PtEntryFlags) -> Self {
        assert_eq!(
            flags.bits() & Self::FLAGS_MASK,
            flags.bits(),
            "flags: {flags:?}"
        );
        let bits = (ppn.value() << 10) | (flags.bits() & Self::FLAGS_MASK);
        Self(bits)
    }

    /// Returns physical address (PA)
    pub(crate) fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 >> 10) << PAGE_SHIFT)
    }

    pub(crate) fn set_phys_addr(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        assert!(!self.is_valid());
        assert!(flags.contains(PtEntryFlags::V));
        *self = Self::new(pa.phys_page_num(), flags);
    }

    /// Returns `true` if this entry is valid
    pub(crate) fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// Returns `true` if this entry is a valid leaf entry.
    pub(crate) fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    /// Returns `true` if this entry is a valid non-leaf entry.
    pub(crate) fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    /// Returns page table entry flags
    pub(crate) fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Sets page table entry flags.
    pub(crate) fn set_flags(&mut self, flags: PtEntryFlags) {
        self.0 &= !Self::FLAGS_MASK;
        self.0 |= flags.bits();
    }

    /// Clears the page table entry.
    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_arena::test_arena;

    fn root<R: RetrieveFrameAllocator<PAGE_SIZE>>() -> NonNull<PageTable<R>> {
        PageTable::try_allocate().unwrap()
    }

    #[test]
    fn mapped_entry_roundtrips_address_and_flags() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        let va = VirtAddr::new(0x4000);
        let pa = PhysAddr::new(0x8020_0000);
        pt.map_page(va, pa, PtEntryFlags::URW).unwrap();

        let pte = pt.find_leaf_entry(va).unwrap();
        assert_eq!(pte.phys_addr(), pa);
        assert_eq!(pte.flags(), PtEntryFlags::URW | PtEntryFlags::V);
    }

    #[test]
    fn walk_below_max_va_succeeds() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        let va = VirtAddr::MAX.byte_sub(PAGE_SIZE);
        pt.map_page(va, PhysAddr::new(0x8000_0000), PtEntryFlags::RX)
            .unwrap();
        assert!(pt.find_leaf_entry(va).is_ok());
    }

    #[test]
    #[should_panic(expected = "va=")]
    fn walk_at_max_va_panics() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        let _ = pt.map_page(VirtAddr::MAX, PhysAddr::new(0x8000_0000), PtEntryFlags::RX);
    }

    #[test]
    fn resolving_above_max_va_fails() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        assert_eq!(
            pt.find_leaf_entry(VirtAddr::MAX).unwrap_err(),
            Error::AddressNotMapped(VirtAddr::MAX)
        );
    }

    #[test]
    #[should_panic(expected = "remap of a mapped address")]
    fn remap_panics() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        pt.map_pages(
            VirtAddr::new(0x5000),
            PAGE_SIZE,
            PhysAddr::new(0x8100_0000),
            PtEntryFlags::URW,
        )
        .unwrap();
        let _ = pt.map_pages(
            VirtAddr::new(0x5000),
            PAGE_SIZE,
            PhysAddr::new(0x8200_0000),
            PtEntryFlags::UR,
        );
    }

    #[test]
    fn map_pages_covers_exactly_the_touched_pages() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        // one byte touches one page
        pt.map_pages(
            VirtAddr::new(0x1000),
            1,
            PhysAddr::new(0x8000_0000),
            PtEntryFlags::RW,
        )
        .unwrap();
        assert!(pt.find_leaf_entry(VirtAddr::new(0x1000)).is_ok());
        assert!(pt.find_leaf_entry(VirtAddr::new(0x2000)).is_err());

        // one byte past a page boundary touches two
        pt.map_pages(
            VirtAddr::new(0x3000),
            PAGE_SIZE + 1,
            PhysAddr::new(0x8010_0000),
            PtEntryFlags::RW,
        )
        .unwrap();
        assert!(pt.find_leaf_entry(VirtAddr::new(0x3000)).is_ok());
        assert!(pt.find_leaf_entry(VirtAddr::new(0x4000)).is_ok());
        assert!(pt.find_leaf_entry(VirtAddr::new(0x5000)).is_err());
    }

    #[test]
    #[should_panic(expected = "unmap of an unmapped address")]
    fn unmap_of_absent_mapping_panics() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        pt.map_page(
            VirtAddr::new(0x1000),
            PhysAddr::new(0x8000_0000),
            PtEntryFlags::RW,
        )
        .unwrap();
        // 0x2000 shares the leaf table with 0x1000 but was never mapped.
        for _ in pt.unmap_pages(VirtAddr::new(0x1000), 2) {}
    }

    #[test]
    fn unmap_yields_the_mapped_frames() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        pt.map_pages(
            VirtAddr::new(0),
            2 * PAGE_SIZE,
            PhysAddr::new(0x8000_0000),
            PtEntryFlags::URW,
        )
        .unwrap();

        let freed: Vec<_> = pt.unmap_pages(VirtAddr::new(0), 2).collect();
        assert_eq!(
            freed,
            [PhysAddr::new(0x8000_0000), PhysAddr::new(0x8000_1000)]
        );
        assert!(pt.find_leaf_entry(VirtAddr::new(0)).is_err());
    }

    #[test]
    fn kernel_style_direct_map_resolves_devices() {
        test_arena!(Frames, 64);
        const PLIC: usize = 0x0c00_0000;
        const TRAMPOLINE_FRAME: usize = 0x8000_5000;

        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        pt.map_pages(
            VirtAddr::new(PLIC),
            0x40_0000,
            PhysAddr::new(PLIC),
            PtEntryFlags::RW,
        )
        .unwrap();
        let trampoline = VirtAddr::MAX.byte_sub(PAGE_SIZE);
        pt.map_pages(
            trampoline,
            PAGE_SIZE,
            PhysAddr::new(TRAMPOLINE_FRAME),
            PtEntryFlags::RX,
        )
        .unwrap();

        let pte = pt.find_leaf_entry(VirtAddr::new(PLIC)).unwrap();
        assert_eq!(pte.phys_addr(), PhysAddr::new(PLIC));
        assert_eq!(pte.flags(), PtEntryFlags::RW | PtEntryFlags::V);
        assert!(!pte.flags().contains(PtEntryFlags::U));

        let pte = pt.find_leaf_entry(trampoline).unwrap();
        assert_eq!(pte.phys_addr(), PhysAddr::new(TRAMPOLINE_FRAME));
        assert_eq!(pte.flags(), PtEntryFlags::RX | PtEntryFlags::V);
        assert!(!pte.flags().contains(PtEntryFlags::U));
    }

    #[test]
    fn free_descendant_returns_every_interior_frame() {
        test_arena!(Frames, 32);
        let before = Frames::retrieve().free_count();

        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        // three widely separated mappings force separate interior tables
        for va in [0usize, 1 << 30, 2 << 30] {
            pt.map_page(
                VirtAddr::new(va),
                PhysAddr::new(0x8000_0000),
                PtEntryFlags::RW,
            )
            .unwrap();
        }
        assert_eq!(Frames::retrieve().free_count(), before - 7);

        for va in [0usize, 1 << 30, 2 << 30] {
            pt.unmap_page(VirtAddr::new(va));
        }
        pt.free_descendant();
        unsafe {
            Frames::retrieve().free(root.cast());
        }
        assert_eq!(Frames::retrieve().free_count(), before);
    }

    #[test]
    fn resolve_requires_flags() {
        test_arena!(Frames, 16);
        let mut root = root::<Frames>();
        let pt = unsafe { root.as_mut() };

        let va = VirtAddr::new(0x1000);
        pt.map_page(va, PhysAddr::new(0x8000_0000), PtEntryFlags::RW)
            .unwrap();

        assert!(pt.resolve_virtual_address(va, PtEntryFlags::RW).is_ok());
        assert_eq!(
            pt.resolve_virtual_address(va, PtEntryFlags::UR).unwrap_err(),
            Error::InaccessibleMemory(va)
        );
    }
}
