#![no_std]
#![no_main]

use core::{
    arch::global_asm,
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

mod console;
mod cpu;
mod interrupt;
mod kernel_vec;
mod memory;
mod param;
mod plic;
mod print;
mod proc;
mod start;
mod sync;
mod trampoline;
mod trap;
mod uart;

global_asm!(
    include_str!("entry.s"),
    STACK0 = sym self::start::STACK0,
    STACK_SIZE = const self::start::STACK_SIZE,
    start = sym self::start::start,
);

static STARTED: AtomicBool = AtomicBool::new(false);

// start() jumps here in supervisor mode on all CPUs.
extern "C" fn main() -> ! {
    if cpu::id() == 0 {
        console::init();
        println!();
        println!("rv39 kernel is booting");
        println!();
        memory::page::init(); // physical page allocator
        memory::kernel::init(); // create kernel page table
        memory::kernel::init_hart(); // turn on paging
        trap::init_hart(); // install kernel trap vector
        plic::init(); // set up interrupt controller
        plic::init_hart(); // ask PLIC for device interrupts
        println!(
            "{} KiB of physical memory free",
            memory::page::free_page_count() * sv39::PAGE_SIZE / 1024
        );

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        println!("hart {} starting", cpu::id());
        memory::kernel::init_hart(); // turn on paging
        trap::init_hart(); // install kernel trap vector
        plic::init_hart(); // ask PLIC for device interrupts
    }

    proc::scheduler()
}
