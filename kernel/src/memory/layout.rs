//! Physical memory layout
//!
//! qemu -machine virt is set up like this,
//! based on qemu's [hw/riscv/virt.c]:
//!
//! ```text
//! 0x0000_1000 -- boot ROM, provided by qemu
//! 0x0200_0000 -- CLINT
//! 0x0c00_0000 -- PLIC
//! 0x1000_0000 -- UART0
//! 0x1000_1000 -- virtio disk
//! 0x8000_0000 -- boot ROM jumps here in machine mode
//!               -kernel loads the kernel here
//! unused RAM after 0x8000_0000.
//! ```
//!
//! the kernel uses physical memory thus:
//!
//! ```text
//! 0x8000_0000 -- KERNEL_BASE. start of kernel text
//! TEXT_END    -- start of kernel data
//! KERNEL_END  -- start of kernel page allocation area
//! PHYS_TOP    -- end of RAM used by the kernel
//! ```
//!
//! [hw/riscv/virt.c]: https://github.com/qemu/qemu/blob/9.2.0/hw/riscv/virt.c

use core::arch::global_asm;

use sv39::{PAGE_SIZE, VirtAddr};

use crate::param::NPROC;

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: usize = 10;

// virtio mmio interface
pub const VIRTIO0: usize = 0x1000_1000;

// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;
pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}
pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}
pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

// core local interruptor (CLINT), which contains the machine-mode timer.
pub const CLINT: usize = 0x0200_0000;
pub const fn clint_mtimecmp(hart: usize) -> usize {
    CLINT + 0x4000 + 8 * hart
}
/// Cycles since boot.
pub const CLINT_MTIME: usize = CLINT + 0xbff8;

// get linker symbol addresses
global_asm!(
    "
        .global _rv39_kernel_base_addr
        _rv39_kernel_base_addr: .dword _rv39_kernel_base
        .global _rv39_text_end_addr
        _rv39_text_end_addr: .dword _rv39_text_end
        .global _rv39_kernel_end_addr
        _rv39_kernel_end_addr: .dword _rv39_kernel_end
        .global _rv39_phys_top_addr
        _rv39_phys_top_addr: .dword _rv39_phys_top
    "
);

unsafe extern "C" {
    // the kernel expects there to be RAM
    // for use by the kernel and user pages
    // from physical address 0x80000000 to PHYS_TOP.
    #[link_name = "_rv39_kernel_base_addr"]
    pub static KERNEL_BASE: usize;

    /// Address of the end of kernel code.
    #[link_name = "_rv39_text_end_addr"]
    pub static TEXT_END: usize;

    /// First address after the kernel image.
    #[link_name = "_rv39_kernel_end_addr"]
    pub static KERNEL_END: usize;

    #[link_name = "_rv39_phys_top_addr"]
    pub static PHYS_TOP: usize;
}

// Every address space maps the trampoline page at the highest virtual
// address; a process's trap frame sits just below it. The addresses are
// fixed by the paging scheme, so they live with the page-table engine.
pub use sv39::{TRAMPOLINE, TRAPFRAME};

/// Virtual address of process `p`'s kernel stack, below the trap frame
/// with one unmapped guard page between neighbouring stacks.
pub const fn kstack(p: usize) -> VirtAddr {
    assert!(p < NPROC);
    TRAPFRAME.byte_sub((1 + (p + 1) * (KSTACK_GUARD_PAGES + KSTACK_PAGES)) * PAGE_SIZE)
}

pub const KSTACK_PAGES: usize = 2;
pub const KSTACK_GUARD_PAGES: usize = 1;
