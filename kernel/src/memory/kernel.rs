use core::ptr::NonNull;

use once_slot::OnceSlot;
use riscv::{asm, register::satp};
use sv39::{PAGE_SIZE, PageTable, PhysAddr, PtEntryFlags, VirtAddr};

use crate::{
    memory::{
        layout::{KERNEL_BASE, PHYS_TOP, PLIC, TEXT_END, TRAMPOLINE, UART0, VIRTIO0},
        page::FrameSource,
    },
    proc, trampoline,
};

/// The kernel's page table, built once by the primary hart during boot
/// and never modified afterwards.
static KERNEL_PAGE_TABLE: OnceSlot<KernelPageTable> = OnceSlot::new();

/// Initializes the one `KernelPageTable`.
pub fn init() {
    KERNEL_PAGE_TABLE.set(KernelPageTable::new());
}

/// Switch h/w page table register to the kernel's page table,
/// and enable paging.
pub fn init_hart() {
    // wait for any previous writes to the page table memory to finish.
    asm::sfence_vma_all();

    let ppn = KERNEL_PAGE_TABLE.get().table().phys_page_num();
    unsafe {
        satp::set(satp::Mode::Sv39, 0, ppn.value());
    }

    // flush stale entries from the TLB.
    asm::sfence_vma_all();
}

unsafe fn ident_map(
    kpgtbl: &mut PageTable<FrameSource>,
    addr: usize,
    size: usize,
    perm: PtEntryFlags,
) -> Result<(), sv39::Error> {
    kpgtbl.map_pages(VirtAddr::new(addr), size, PhysAddr::new(addr), perm)
}

pub struct KernelPageTable(NonNull<PageTable<FrameSource>>);

// Frozen after construction and only ever read, from any hart.
unsafe impl Send for KernelPageTable {}
unsafe impl Sync for KernelPageTable {}

impl KernelPageTable {
    /// Makes a direct-map page table for the kernel.
    pub fn new() -> Self {
        use PtEntryFlags as F;

        let rw = F::RW;
        let rx = F::RX;

        let mut root = PageTable::<FrameSource>::try_allocate().unwrap();
        let kpgtbl = unsafe { root.as_mut() };

        unsafe {
            // uart registers
            ident_map(kpgtbl, UART0, PAGE_SIZE, rw).unwrap();

            // virtio mmio disk interface
            ident_map(kpgtbl, VIRTIO0, PAGE_SIZE, rw).unwrap();

            // PLIC
            ident_map(kpgtbl, PLIC, 0x40_0000, rw).unwrap();

            // map kernel text executable and read-only.
            ident_map(kpgtbl, KERNEL_BASE, TEXT_END - KERNEL_BASE, rx).unwrap();

            // map kernel data and the physical RAM we'll make use of.
            ident_map(kpgtbl, TEXT_END, PHYS_TOP - TEXT_END, rw).unwrap();

            // map the trampoline for trap entry/exit to
            // the highest virtual address in the kernel.
            kpgtbl
                .map_pages(
                    TRAMPOLINE,
                    PAGE_SIZE,
                    PhysAddr::new(trampoline::trampoline_addr()),
                    rx,
                )
                .unwrap();

            // allocate and map a kernel stack for each process.
            proc::map_stacks(kpgtbl);
        }

        Self(root)
    }

    fn table(&self) -> &PageTable<FrameSource> {
        unsafe { self.0.as_ref() }
    }
}
