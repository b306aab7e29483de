use core::{ptr::NonNull, slice};

use frame_alloc::RetrieveFrameAllocator;

use crate::{
    PAGE_SIZE, TRAMPOLINE, TRAPFRAME,
    addr::{PageRound as _, PhysAddr, PhysPageNum, VirtAddr},
    error::Error,
    page_table::{PageTable, PtEntryFlags},
};

/// A per-process address space: a root page table plus the byte size of
/// the contiguous mapped region `[0, size)`.
///
/// Leaf mappings in `[0, size)` carry `U`. The only other mappings are
/// the two fixed kernel-only pages at the top: the shared trampoline at
/// [`TRAMPOLINE`] and this process's trap frame at [`TRAPFRAME`].
/// Nothing maps at or above [`VirtAddr::MAX`].
pub struct UserAddressSpace<R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    root: NonNull<PageTable<R>>,
    size: usize,
}

// An address space is owned by exactly one process, which is the only
// mutator of its tables; moving it between harts is safe.
unsafe impl<R> Send for UserAddressSpace<R> where R: RetrieveFrameAllocator<PAGE_SIZE> {}

impl<R> UserAddressSpace<R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    /// Creates a user address space with no user memory, but with the
    /// trampoline and trap-frame pages mapped.
    ///
    /// `trampoline` and `trapframe` are the physical addresses of the
    /// shared trap entry/exit page and of this process's trap save area;
    /// they are mapped R+X and R+W at [`TRAMPOLINE`] and [`TRAPFRAME`],
    /// without `U`, so trap handling keeps working across the SATP
    /// switch while user code cannot touch either page.
    pub fn new(trampoline: PhysAddr, trapframe: PhysAddr) -> Result<Self, Error> {
        let mut root = PageTable::try_allocate()?;
        let pt = unsafe { root.as_mut() };

        if let Err(e) = pt.map_page(TRAMPOLINE, trampoline, PtEntryFlags::RX) {
            pt.free_descendant();
            unsafe {
                R::retrieve().free(root.cast());
            }
            return Err(e);
        }

        if let Err(e) = pt.map_page(TRAPFRAME, trapframe, PtEntryFlags::RW) {
            pt.unmap_page(TRAMPOLINE);
            pt.free_descendant();
            unsafe {
                R::retrieve().free(root.cast());
            }
            return Err(e);
        }

        Ok(Self { root, size: 0 })
    }

    fn table(&self) -> &PageTable<R> {
        unsafe { self.root.as_ref() }
    }

    fn table_mut(&mut self) -> &mut PageTable<R> {
        unsafe { self.root.as_mut() }
    }

    /// Returns the process size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the physical page number of the root table, for SATP.
    pub fn phys_page_num(&self) -> PhysPageNum {
        self.table().phys_page_num()
    }

    /// Loads an initial image into address 0.
    ///
    /// For the very first process. `src.len()` must be less than a page.
    pub fn map_first(&mut self, src: &[u8]) -> Result<(), Error> {
        assert!(src.len() < PAGE_SIZE, "src.len()={:#x}", src.len());

        let mem = R::retrieve().alloc_zeroed().ok_or(Error::NoFreeFrame)?;
        if let Err(e) =
            self.table_mut()
                .map_page(VirtAddr::new(0), PhysAddr::from_ptr(mem), PtEntryFlags::URWX)
        {
            unsafe {
                R::retrieve().free(mem);
            }
            return Err(e);
        }
        unsafe { slice::from_raw_parts_mut(mem.as_ptr(), src.len()) }.copy_from_slice(src);
        self.size = PAGE_SIZE;

        Ok(())
    }

    /// Allocates zeroed frames mapped `U|R|W|X` to grow the process to
    /// `new_size` bytes, which need not be page-aligned.
    ///
    /// On failure the address space is rolled back to its old size.
    pub fn grow_to(&mut self, new_size: usize) -> Result<(), Error> {
        if new_size < self.size {
            return Ok(());
        }

        let old_size = self.size;
        let mut va = self.size.page_roundup();
        while va < new_size {
            let Some(mem) = R::retrieve().alloc_zeroed() else {
                self.size = va;
                self.shrink_to(old_size);
                return Err(Error::NoFreeFrame);
            };

            if let Err(e) = self.table_mut().map_page(
                VirtAddr::new(va),
                PhysAddr::from_ptr(mem),
                PtEntryFlags::URWX,
            ) {
                unsafe {
                    R::retrieve().free(mem);
                }
                self.size = va;
                self.shrink_to(old_size);
                return Err(e);
            }

            va += PAGE_SIZE;
        }
        self.size = new_size;

        Ok(())
    }

    /// Unmaps and frees user pages to bring the process down to
    /// `new_size` bytes. Never grows.
    pub fn shrink_to(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }

        if new_size.page_roundup() < self.size.page_roundup() {
            let npages = (self.size.page_roundup() - new_size.page_roundup()) / PAGE_SIZE;
            let start = VirtAddr::new(new_size.page_roundup());
            for pa in self.table_mut().unmap_pages(start, npages) {
                unsafe {
                    R::retrieve().free(pa.as_mut_ptr());
                }
            }
        }

        self.size = new_size;
    }

    /// Copies this address space into `target`: both the page tables and
    /// the data, with each leaf's flags preserved.
    ///
    /// On failure every page already installed in `target` is unmapped
    /// and freed again.
    ///
    /// # Panics
    ///
    /// Panics if a page inside `[0, size)` is not mapped here; the caller
    /// owns that invariant.
    pub fn try_clone_into(&self, target: &mut Self) -> Result<(), Error> {
        target.shrink_to(0);

        let res = (|| {
            let mut va = 0;
            while va < self.size {
                target.size = va;

                let Ok(pte) = self.table().find_leaf_entry(VirtAddr::new(va)) else {
                    panic!("clone of an unmapped page: va={va:#x}");
                };
                let src_pa = pte.phys_addr();
                let flags = pte.flags().difference(PtEntryFlags::V);

                let dst = R::retrieve().alloc().ok_or(Error::NoFreeFrame)?;
                unsafe {
                    dst.as_ptr().copy_from(src_pa.as_ptr(), PAGE_SIZE);
                }

                if let Err(e) =
                    target
                        .table_mut()
                        .map_page(VirtAddr::new(va), PhysAddr::from_ptr(dst), flags)
                {
                    unsafe {
                        R::retrieve().free(dst);
                    }
                    return Err(e);
                }

                va += PAGE_SIZE;
            }
            target.size = self.size;
            Ok(())
        })();

        if res.is_err() {
            target.shrink_to(0);
        }
        res
    }

    /// Clears the `U` bit on the leaf at `va`.
    ///
    /// Used by exec to make the page below the user stack inaccessible
    /// from user mode without unmapping it.
    pub fn forbid_user_access(&mut self, va: VirtAddr) -> Result<(), Error> {
        self.table_mut().update_level0_entry(va, false, |pte| {
            let mut flags = pte.flags();
            flags.remove(PtEntryFlags::U);
            pte.set_flags(flags);
        })
    }

    /// Copies from kernel to user: `src` to virtual address `dst_va`.
    ///
    /// Walks the tables page by page; the user page table need not be the
    /// active one.
    pub fn copy_out(&mut self, dst_va: VirtAddr, mut src: &[u8]) -> Result<(), Error> {
        let mut dst_va = dst_va;
        while !src.is_empty() {
            let va0 = dst_va.page_rounddown();
            let offset = dst_va.addr() - va0.addr();
            let n = usize::min(PAGE_SIZE - offset, src.len());

            let page = self.table_mut().fetch_page_mut(va0, PtEntryFlags::UW)?;
            page[offset..][..n].copy_from_slice(&src[..n]);

            src = &src[n..];
            dst_va = va0.byte_add(PAGE_SIZE);
        }

        Ok(())
    }

    /// Copies from user to kernel: virtual address `src_va` into `dst`.
    pub fn copy_in(&self, mut dst: &mut [u8], src_va: VirtAddr) -> Result<(), Error> {
        let mut src_va = src_va;
        while !dst.is_empty() {
            let va0 = src_va.page_rounddown();
            let offset = src_va.addr() - va0.addr();
            let n = usize::min(PAGE_SIZE - offset, dst.len());

            let page = self.table().fetch_page(va0, PtEntryFlags::UR)?;
            dst[..n].copy_from_slice(&page[offset..][..n]);

            dst = &mut dst[n..];
            src_va = va0.byte_add(PAGE_SIZE);
        }

        Ok(())
    }

    /// Copies a NUL-terminated string from user virtual address `src_va`
    /// into `dst`, NUL included.
    ///
    /// Returns the string length (without the NUL), or
    /// [`Error::UnterminatedString`] if no NUL appears within
    /// `dst.len()` bytes.
    pub fn copy_in_str(&self, dst: &mut [u8], src_va: VirtAddr) -> Result<usize, Error> {
        let mut copied = 0;
        let mut src_va = src_va;
        while copied < dst.len() {
            let va0 = src_va.page_rounddown();
            let offset = src_va.addr() - va0.addr();
            let n = usize::min(PAGE_SIZE - offset, dst.len() - copied);

            let page = self.table().fetch_page(va0, PtEntryFlags::UR)?;
            let chunk = &page[offset..][..n];
            match memchr::memchr(b'\0', chunk) {
                Some(i) => {
                    dst[copied..][..=i].copy_from_slice(&chunk[..=i]);
                    return Ok(copied + i);
                }
                None => {
                    dst[copied..][..n].copy_from_slice(chunk);
                    copied += n;
                    src_va = va0.byte_add(PAGE_SIZE);
                }
            }
        }

        Err(Error::UnterminatedString)
    }
}

impl<R> Drop for UserAddressSpace<R>
where
    R: RetrieveFrameAllocator<PAGE_SIZE>,
{
    fn drop(&mut self) {
        // neither frame is owned by this address space: the trampoline is
        // shared and the trap frame belongs to the process entry.
        self.table_mut().unmap_page(TRAMPOLINE);
        self.table_mut().unmap_page(TRAPFRAME);

        if self.size > 0 {
            let npages = self.size.page_roundup() / PAGE_SIZE;
            for pa in self.table_mut().unmap_pages(VirtAddr::new(0), npages) {
                unsafe {
                    R::retrieve().free(pa.as_mut_ptr());
                }
            }
        }
        self.table_mut().free_descendant();
        unsafe {
            R::retrieve().free(self.root.cast());
        }
    }
}

#[cfg(test)]
mod tests {
    use frame_alloc::RetrieveFrameAllocator;

    use super::*;
    use crate::test_arena::test_arena;

    // stand-ins for the shared trampoline page and a per-process trap
    // frame; the tests never dereference either.
    const TRAMPOLINE_PA: PhysAddr = PhysAddr::new(0x8000_5000);
    const TRAPFRAME_PA: PhysAddr = PhysAddr::new(0x8700_0000);

    fn new_uas<R: RetrieveFrameAllocator<PAGE_SIZE>>() -> UserAddressSpace<R> {
        UserAddressSpace::new(TRAMPOLINE_PA, TRAPFRAME_PA).unwrap()
    }

    #[test]
    fn new_spaces_map_the_trampoline_and_trap_frame() {
        test_arena!(Frames, 32);
        let uas = new_uas::<Frames>();

        let pte = uas.table().find_leaf_entry(TRAMPOLINE).unwrap();
        assert_eq!(pte.phys_addr(), TRAMPOLINE_PA);
        assert_eq!(pte.flags(), PtEntryFlags::RX | PtEntryFlags::V);

        let pte = uas.table().find_leaf_entry(TRAPFRAME).unwrap();
        assert_eq!(pte.phys_addr(), TRAPFRAME_PA);
        assert_eq!(pte.flags(), PtEntryFlags::RW | PtEntryFlags::V);

        // neither page is reachable from user mode
        let mut buf = [0_u8; 1];
        assert!(uas.copy_in(&mut buf, TRAMPOLINE).is_err());
        assert!(uas.copy_in(&mut buf, TRAPFRAME).is_err());
    }

    #[test]
    fn failed_new_releases_the_root() {
        // room for the root and one interior table, not for the full
        // trampoline walk
        test_arena!(Frames, 2);
        let before = Frames::retrieve().free_count();

        assert!(UserAddressSpace::<Frames>::new(TRAMPOLINE_PA, TRAPFRAME_PA).is_err());
        assert_eq!(Frames::retrieve().free_count(), before);
    }

    #[test]
    fn map_first_installs_the_image_at_address_zero() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();

        let image = [0x13_u8, 0x05, 0x45, 0x01, 0x93, 0x85];
        uas.map_first(&image).unwrap();
        assert_eq!(uas.size(), PAGE_SIZE);

        let mut buf = [0_u8; 8];
        uas.copy_in(&mut buf, VirtAddr::new(0)).unwrap();
        assert_eq!(&buf[..6], &image);
        // the rest of the page is zeroed
        assert_eq!(&buf[6..], &[0, 0]);
    }

    #[test]
    fn grow_rounds_the_old_size_up() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();

        uas.grow_to(PAGE_SIZE - 1).unwrap();
        let before = Frames::retrieve().free_count();

        // [PAGE_SIZE - 1, PAGE_SIZE + 1) only touches the second page.
        uas.grow_to(PAGE_SIZE + 1).unwrap();
        assert_eq!(uas.size(), PAGE_SIZE + 1);
        assert_eq!(Frames::retrieve().free_count(), before - 1);
    }

    #[test]
    fn failed_grow_rolls_back() {
        // the root, the trampoline/trap-frame tables, the two interior
        // tables for address 0 and one data page fit; a second data page
        // does not.
        test_arena!(Frames, 6);
        let mut uas = new_uas::<Frames>();

        uas.grow_to(PAGE_SIZE).unwrap();
        let before = Frames::retrieve().free_count();

        assert_eq!(uas.grow_to(8 * PAGE_SIZE), Err(Error::NoFreeFrame));
        assert_eq!(uas.size(), PAGE_SIZE);
        assert_eq!(Frames::retrieve().free_count(), before);

        let mut buf = [0_u8; 1];
        assert!(uas.copy_in(&mut buf, VirtAddr::new(0)).is_ok());
        assert!(uas.copy_in(&mut buf, VirtAddr::new(PAGE_SIZE)).is_err());
    }

    #[test]
    fn shrink_frees_only_whole_pages() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();

        uas.grow_to(4 * PAGE_SIZE).unwrap();
        let before = Frames::retrieve().free_count();

        uas.shrink_to(PAGE_SIZE + 1);
        assert_eq!(uas.size(), PAGE_SIZE + 1);
        // pages 2 and 3 freed; the partially used second page stays
        assert_eq!(Frames::retrieve().free_count(), before + 2);

        uas.shrink_to(2 * PAGE_SIZE);
        assert_eq!(uas.size(), PAGE_SIZE + 1, "shrink must never grow");
    }

    #[test]
    fn clone_copies_data_and_unshares_frames() {
        test_arena!(Frames, 64);
        let mut parent = new_uas::<Frames>();
        parent.grow_to(2 * PAGE_SIZE).unwrap();
        parent.copy_out(VirtAddr::new(0), &[0xab]).unwrap();
        parent
            .copy_out(VirtAddr::new(PAGE_SIZE), &[0xcd])
            .unwrap();

        let mut child = new_uas::<Frames>();
        parent.try_clone_into(&mut child).unwrap();
        assert_eq!(child.size(), parent.size());

        for va in [0, PAGE_SIZE] {
            let va = VirtAddr::new(va);
            let ppte = parent.table().find_leaf_entry(va).unwrap();
            let cpte = child.table().find_leaf_entry(va).unwrap();
            assert_ne!(ppte.phys_addr(), cpte.phys_addr());
            assert_eq!(ppte.flags(), cpte.flags());
        }

        // writes to the parent don't reach the child
        parent.copy_out(VirtAddr::new(0), &[0x00]).unwrap();

        let mut buf = [0_u8; 1];
        child.copy_in(&mut buf, VirtAddr::new(0)).unwrap();
        assert_eq!(buf, [0xab]);
        child.copy_in(&mut buf, VirtAddr::new(PAGE_SIZE)).unwrap();
        assert_eq!(buf, [0xcd]);
    }

    #[test]
    fn failed_clone_leaves_the_target_empty() {
        // enough for the parent, not enough for a full copy
        test_arena!(Frames, 12);
        let mut parent = new_uas::<Frames>();
        parent.grow_to(4 * PAGE_SIZE).unwrap();

        let before = Frames::retrieve().free_count();
        let mut child = new_uas::<Frames>();

        assert_eq!(
            parent.try_clone_into(&mut child),
            Err(Error::NoFreeFrame)
        );
        assert_eq!(child.size(), 0);
        let mut buf = [0_u8; 1];
        assert!(child.copy_in(&mut buf, VirtAddr::new(0)).is_err());

        // the copied data pages were returned; the child keeps only its
        // root and interior tables until it is dropped
        drop(child);
        assert_eq!(Frames::retrieve().free_count(), before);
    }

    #[test]
    fn dropping_an_address_space_frees_everything() {
        test_arena!(Frames, 32);
        let before = Frames::retrieve().free_count();

        let mut uas = new_uas::<Frames>();
        uas.grow_to(4 * PAGE_SIZE).unwrap();
        assert_ne!(Frames::retrieve().free_count(), before);

        drop(uas);
        assert_eq!(Frames::retrieve().free_count(), before);
    }

    #[test]
    fn copy_roundtrip_crosses_page_boundaries() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(3 * PAGE_SIZE).unwrap();

        let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let va = VirtAddr::new(100); // deliberately unaligned
        uas.copy_out(va, &data).unwrap();

        let mut back = vec![0_u8; data.len()];
        uas.copy_in(&mut back, va).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn copy_fails_on_unmapped_addresses() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(PAGE_SIZE).unwrap();

        // runs off the end of the mapped region
        assert!(
            uas.copy_out(VirtAddr::new(PAGE_SIZE - 2), &[0; 4])
                .is_err()
        );

        let mut buf = [0_u8; 4];
        assert!(
            uas.copy_in(&mut buf, VirtAddr::new(2 * PAGE_SIZE))
                .is_err()
        );
    }

    #[test]
    fn copy_in_str_stops_at_the_nul() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(3 * PAGE_SIZE).unwrap();

        let va = VirtAddr::new(0x2000);
        uas.copy_out(va, b"hello\0world").unwrap();

        let mut dst = [0xff_u8; 16];
        assert_eq!(uas.copy_in_str(&mut dst, va), Ok(5));
        assert_eq!(&dst[..6], b"hello\0");

        let mut dst = [0xff_u8; 3];
        assert_eq!(
            uas.copy_in_str(&mut dst, va),
            Err(Error::UnterminatedString)
        );
    }

    #[test]
    fn copy_in_str_nul_at_the_last_byte() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(PAGE_SIZE).unwrap();

        uas.copy_out(VirtAddr::new(0), b"ab\0").unwrap();

        // NUL is the max-th byte: fits
        let mut dst = [0xff_u8; 3];
        assert_eq!(uas.copy_in_str(&mut dst, VirtAddr::new(0)), Ok(2));
        assert_eq!(&dst, b"ab\0");

        // NUL is one past the buffer: does not
        let mut dst = [0xff_u8; 2];
        assert_eq!(
            uas.copy_in_str(&mut dst, VirtAddr::new(0)),
            Err(Error::UnterminatedString)
        );
    }

    #[test]
    fn copy_in_str_spans_pages() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(2 * PAGE_SIZE).unwrap();

        let va = VirtAddr::new(PAGE_SIZE - 3);
        uas.copy_out(va, b"abcdef\0").unwrap();

        let mut dst = [0_u8; 16];
        assert_eq!(uas.copy_in_str(&mut dst, va), Ok(6));
        assert_eq!(&dst[..7], b"abcdef\0");
    }

    #[test]
    fn guard_page_blocks_user_access() {
        test_arena!(Frames, 32);
        let mut uas = new_uas::<Frames>();
        uas.grow_to(2 * PAGE_SIZE).unwrap();

        let guard = VirtAddr::new(PAGE_SIZE);
        uas.forbid_user_access(guard).unwrap();

        assert_eq!(
            uas.copy_out(guard, &[1]),
            Err(Error::InaccessibleMemory(guard))
        );
        // the page below is still fine
        assert!(uas.copy_out(VirtAddr::new(0), &[1]).is_ok());
    }
}
