use core::ptr;

use riscv::register::{
    medeleg::{self, Medeleg},
    mepc, mhartid, mie, mscratch,
    mideleg::{self, Mideleg},
    mstatus,
    mtvec::{self, Mtvec},
    pmpaddr0, pmpcfg0,
    satp::{self, Satp},
    sie,
};

use crate::{
    cpu, kernel_vec,
    main,
    memory::layout::{clint_mtimecmp, CLINT_MTIME},
    param::NCPU,
};

// entry.s needs one stack per CPU.
pub const STACK_SIZE: usize = 4096;
pub static mut STACK0: [u8; STACK_SIZE * NCPU] = [0; STACK_SIZE * NCPU];

/// Cycles between timer interrupts; about 1/10th second in qemu.
const TIMER_INTERVAL: u64 = 1_000_000;

/// A scratch area per CPU for machine-mode timer interrupts.
///
/// `timer_vec` in kernel_vec.s uses words 0..=2 to save registers, word 3
/// for the address of this hart's CLINT MTIMECMP register and word 4 for
/// the interval between interrupts.
static mut TIMER_SCRATCH: [[u64; 5]; NCPU] = [[0; 5]; NCPU];

// entry.s jumps here in machine mode on STACK0.
pub extern "C" fn start() -> ! {
    // set M Previous Privilege mode to Supervisor, for mret.
    unsafe {
        mstatus::set_mpp(mstatus::MPP::Supervisor);
    }

    // set M Exception Program Counter to main, for mret.
    unsafe {
        mepc::write(main as usize);
    }

    // disable paging for now.
    let satp = Satp::from_bits(0);
    unsafe {
        satp::write(satp);
    }

    // delegate all interrupts and exceptions to supervisor mode.
    unsafe {
        medeleg::write(Medeleg::from_bits(0xffff));
        mideleg::write(Mideleg::from_bits(0xffff));
        let mut sie = sie::read();
        sie.set_sext(true);
        sie.set_stimer(true);
        sie.set_ssoft(true);
        sie::write(sie);
    }

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    unsafe {
        pmpaddr0::write(0x3f_ffff_ffff_ffff);
    }
    unsafe {
        pmpcfg0::write(0xf);
    }

    // ask for clock interrupts.
    timer_init();

    // keep each CPU's hartid in its tp register, for `cpu::id()`.
    let id = mhartid::read();
    unsafe {
        cpu::set_id(id);
    }

    unsafe {
        core::arch::asm!("mret", options(noreturn));
    }
}

/// Arranges to receive timer interrupts.
///
/// They arrive in machine mode at `timer_vec` in kernel_vec.s, which turns
/// them into supervisor software interrupts for `trap_kernel()`.
fn timer_init() {
    // each CPU has a separate source of timer interrupts.
    let id = mhartid::read();

    // ask the CLINT for a timer interrupt.
    unsafe {
        let mtimecmp = ptr::with_exposed_provenance_mut::<u64>(clint_mtimecmp(id));
        let mtime = ptr::with_exposed_provenance::<u64>(CLINT_MTIME);
        mtimecmp.write_volatile(mtime.read_volatile() + TIMER_INTERVAL);
    }

    // prepare information in TIMER_SCRATCH[id] for timer_vec.
    let scratch: *mut u64 = unsafe { (*(&raw mut TIMER_SCRATCH))[id].as_mut_ptr() };
    unsafe {
        scratch.add(3).write(clint_mtimecmp(id) as u64);
        scratch.add(4).write(TIMER_INTERVAL);
        mscratch::write(scratch as usize);
    }

    // set the machine-mode trap handler.
    let mut mtvec = Mtvec::from_bits(0);
    mtvec.set_address(kernel_vec::timer_vec_addr());
    mtvec.set_trap_mode(mtvec::TrapMode::Direct);
    unsafe {
        mtvec::write(mtvec);
    }

    // enable machine-mode interrupts.
    unsafe {
        mstatus::set_mie();
    }

    // enable machine-mode timer interrupts.
    unsafe {
        mie::set_mtimer();
    }
}
