//! The corner of the process subsystem the memory core depends on:
//! per-process kernel stacks and the per-hart scheduler entry.

use riscv::asm;
use sv39::{PAGE_SIZE, PageTable, PhysAddr, PtEntryFlags};

use crate::{
    interrupt,
    memory::{
        layout::{self, KSTACK_PAGES},
        page::{self, FrameSource},
    },
    param::NPROC,
};

/// Trap save area, mapped at `layout::TRAPFRAME` in each user address
/// space. trampoline.s spills and reloads user registers here on the way
/// in and out of the kernel; the `kernel_*` fields tell it where to land.
#[repr(C)]
pub struct TrapFrame {
    /// Kernel page table.
    pub kernel_satp: usize,
    /// Top of the process's kernel stack.
    pub kernel_sp: usize,
    /// Address of the kernel's user-trap handler.
    pub kernel_trap: usize,
    /// Saved user program counter.
    pub epc: usize,
    /// Saved kernel tp (the hart id).
    pub kernel_hartid: usize,
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

/// Allocates a kernel stack for each process slot and maps it high in the
/// kernel's address space, leaving an unmapped guard page below each one.
pub fn map_stacks(kpgtbl: &mut PageTable<FrameSource>) {
    for p in 0..NPROC {
        let va = layout::kstack(p);
        for i in 0..KSTACK_PAGES {
            let frame = page::alloc_page().expect("out of memory mapping kernel stacks");
            kpgtbl
                .map_page(
                    va.byte_add(i * PAGE_SIZE),
                    PhysAddr::from_ptr(frame),
                    PtEntryFlags::RW,
                )
                .unwrap();
        }
    }
}

/// Per-hart scheduler loop.
///
/// There are no runnable processes yet, so every hart simply waits for
/// interrupts with paging and timer ticks live.
pub fn scheduler() -> ! {
    loop {
        // the devices might interrupt to break us out of wfi.
        interrupt::enable();
        asm::wfi();
    }
}
