use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    cpu::{self, INVALID_CPUID},
    interrupt,
};

struct RawSpinLock {
    locked: AtomicBool,
    cpuid: UnsafeCell<usize>,
}

unsafe impl Sync for RawSpinLock {}

impl RawSpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpuid: UnsafeCell::new(INVALID_CPUID),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    fn acquire(&self) {
        // disable interrupts to avoid deadlock.
        let int_guard = interrupt::push_disabled();

        assert!(!self.holding(), "spinlock is already held by this cpu");

        // `Ordering::Acquire` tells the compiler and the processor to not move loads or
        // stores past this point, to ensure that the critical section's memory
        // references happen strictly after the lock is acquired.
        // On RISC-V, this emits a fence instruction.
        while self.locked.swap(true, Ordering::Acquire) {}

        // Record info about lock acquisition for holding() and debugging.
        unsafe {
            *self.cpuid.get() = cpu::id();
        }

        int_guard.forget(); // drop re-enables interrupts, so we must forget it here.
    }

    /// Releases the lock.
    fn release(&self) {
        assert!(self.holding(), "spinlock is not held by this cpu");

        unsafe {
            *self.cpuid.get() = INVALID_CPUID;
        }

        // `Ordering::Release` tells the compiler and the CPU to not move loads or
        // stores past this point, to ensure that all the stores in the critical
        // section are visible to other CPUs before the lock is released,
        // and that loads in the critical section occur strictly before
        // the lock is released.
        // On RISC-V, this emits a fence instruction.
        self.locked.store(false, Ordering::Release);

        unsafe {
            interrupt::pop_disabled();
        }
    }

    /// Checks whether this cpu is holding the lock.
    ///
    /// Interrupts must be off.
    fn holding(&self) -> bool {
        assert!(!interrupt::is_enabled());
        self.locked.load(Ordering::Relaxed) && unsafe { *self.cpuid.get() } == cpu::id()
    }
}

pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
