//! Trap entry/exit code shared by every address space.
//!
//! The page holding `user_vec` and `user_ret` is mapped R+X at
//! `layout::TRAMPOLINE`, the highest virtual address, in the kernel's page
//! table and in every user page table, so the code keeps executing across
//! the SATP switch it performs.

use core::{arch::global_asm, mem::offset_of};

use crate::{memory::layout::TRAPFRAME, proc::TrapFrame};

global_asm!(
    include_str!("trampoline.s"),
    trapframe = const TRAPFRAME.addr(),
    tf_kernel_satp = const offset_of!(TrapFrame, kernel_satp),
    tf_kernel_sp = const offset_of!(TrapFrame, kernel_sp),
    tf_kernel_trap = const offset_of!(TrapFrame, kernel_trap),
    tf_kernel_hartid = const offset_of!(TrapFrame, kernel_hartid),
    tf_ra = const offset_of!(TrapFrame, ra),
    tf_sp = const offset_of!(TrapFrame, sp),
    tf_gp = const offset_of!(TrapFrame, gp),
    tf_tp = const offset_of!(TrapFrame, tp),
    tf_t0 = const offset_of!(TrapFrame, t0),
    tf_t1 = const offset_of!(TrapFrame, t1),
    tf_t2 = const offset_of!(TrapFrame, t2),
    tf_s0 = const offset_of!(TrapFrame, s0),
    tf_s1 = const offset_of!(TrapFrame, s1),
    tf_a0 = const offset_of!(TrapFrame, a0),
    tf_a1 = const offset_of!(TrapFrame, a1),
    tf_a2 = const offset_of!(TrapFrame, a2),
    tf_a3 = const offset_of!(TrapFrame, a3),
    tf_a4 = const offset_of!(TrapFrame, a4),
    tf_a5 = const offset_of!(TrapFrame, a5),
    tf_a6 = const offset_of!(TrapFrame, a6),
    tf_a7 = const offset_of!(TrapFrame, a7),
    tf_s2 = const offset_of!(TrapFrame, s2),
    tf_s3 = const offset_of!(TrapFrame, s3),
    tf_s4 = const offset_of!(TrapFrame, s4),
    tf_s5 = const offset_of!(TrapFrame, s5),
    tf_s6 = const offset_of!(TrapFrame, s6),
    tf_s7 = const offset_of!(TrapFrame, s7),
    tf_s8 = const offset_of!(TrapFrame, s8),
    tf_s9 = const offset_of!(TrapFrame, s9),
    tf_s10 = const offset_of!(TrapFrame, s10),
    tf_s11 = const offset_of!(TrapFrame, s11),
    tf_t3 = const offset_of!(TrapFrame, t3),
    tf_t4 = const offset_of!(TrapFrame, t4),
    tf_t5 = const offset_of!(TrapFrame, t5),
    tf_t6 = const offset_of!(TrapFrame, t6),
);

unsafe extern "C" {
    fn trampoline();
}

/// Physical address of the trampoline page (the kernel image is
/// direct-mapped, so its link address is its physical address).
pub fn trampoline_addr() -> usize {
    trampoline as usize
}
