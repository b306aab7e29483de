use core::arch::asm;

use riscv::{
    interrupt::{
        Trap,
        supervisor::{Exception, Interrupt},
    },
    register::{
        scause, sepc,
        sstatus::{self, SPP},
        stval,
        stvec::{self, Stvec, TrapMode},
    },
};

use crate::{interrupt, kernel_vec, memory::layout::UART0_IRQ, plic, println, uart};

/// Installs the supervisor trap vector on this hart.
pub fn init_hart() {
    let mut stvec = Stvec::from_bits(0);
    stvec.set_address(kernel_vec::kernel_vec_addr());
    stvec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(stvec);
    }
}

/// Handles an interrupt or exception taken while in supervisor mode.
///
/// Called from kernel_vec.s on the current kernel stack.
pub extern "C" fn trap_kernel() {
    let sstatus = sstatus::read();
    let scause = scause::read();

    assert_eq!(sstatus.spp(), SPP::Supervisor, "trap not from supervisor mode");
    assert!(!interrupt::is_enabled(), "trap with interrupts enabled");

    let cause: Trap<Interrupt, Exception> = scause.cause().try_into().unwrap();
    match cause {
        Trap::Interrupt(Interrupt::SupervisorSoft) => handle_timer_interrupt(),
        Trap::Interrupt(Interrupt::SupervisorExternal) => handle_device_interrupt(),
        _ => {
            println!(
                "scause={:#x} sepc={:#x} stval={:#x}",
                scause.bits(),
                sepc::read(),
                stval::read(),
            );
            panic!("trap_kernel");
        }
    }
}

/// The machine-mode timer vector turned a CLINT interrupt into a
/// supervisor software interrupt; acknowledge it.
fn handle_timer_interrupt() {
    // clear SSIP, which timer_vec raised.
    unsafe {
        asm!("csrc sip, {}", in(reg) 1_usize << 1);
    }
}

/// A device signalled through the PLIC.
fn handle_device_interrupt() {
    let irq = plic::claim();
    if irq == UART0_IRQ {
        uart::handle_interrupt();
    } else if irq != 0 {
        println!("unexpected interrupt irq={irq}");
    }

    if irq != 0 {
        plic::complete(irq);
    }
}
