//! Cross-CPU lock coordination
//!
//! Two CPU bitmasks answer "who holds what" in O(1) without taking any
//! lock: `lockset` (CPUs whose running task holds the preemption lock)
//! and `irqset` (CPUs inside the global critical section).
//!
//! [`CriticalSection`] is the only way to reach the shared scheduler
//! state: local interrupts off, the task-list spinlock held, and this
//! CPU's bit set in `irqset`.
//!
//! Author: Moroya Sakamoto

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::arch::{Arch, IrqState};
use crate::error::fatal;
use crate::task::{CpuSet, MAX_CPUS};

/// Lock holder bitmasks
#[derive(Debug, Default)]
pub struct CpuLockState {
    lockset: AtomicU32,
    irqset: AtomicU32,
}

#[inline]
fn bit(cpu: usize) -> u32 {
    if cpu >= MAX_CPUS {
        fatal(format_args!("cpu {} out of range", cpu));
    }
    1 << cpu
}

impl CpuLockState {
    pub const fn new() -> Self {
        Self {
            lockset: AtomicU32::new(0),
            irqset: AtomicU32::new(0),
        }
    }

    /// Record that `cpu` took the preemption lock
    pub fn lock_cpu(&self, cpu: usize) {
        self.lockset.fetch_or(bit(cpu), Ordering::AcqRel);
    }

    /// Record that `cpu` dropped the preemption lock
    pub fn unlock_cpu(&self, cpu: usize) {
        self.lockset.fetch_and(!bit(cpu), Ordering::AcqRel);
    }

    /// Does any CPU hold the preemption lock?
    pub fn is_locked_global(&self) -> bool {
        self.lockset.load(Ordering::Acquire) != 0
    }

    pub fn is_locked_by(&self, cpu: usize) -> bool {
        self.lockset.load(Ordering::Acquire) & bit(cpu) != 0
    }

    pub fn lock_holders(&self) -> CpuSet {
        CpuSet::from_bits(self.lockset.load(Ordering::Acquire))
    }

    /// Record entry of `cpu` into the critical section.
    ///
    /// Fatal if the CPU is already inside: the spinlock is not reentrant.
    pub fn irq_enter(&self, cpu: usize) {
        let prev = self.irqset.fetch_or(bit(cpu), Ordering::AcqRel);
        if prev & bit(cpu) != 0 {
            fatal(format_args!("recursive critical section on cpu {}", cpu));
        }
    }

    /// Record exit of `cpu`; fatal if `cpu` was not the holder.
    pub fn irq_leave(&self, cpu: usize) {
        let prev = self.irqset.fetch_and(!bit(cpu), Ordering::AcqRel);
        if prev & bit(cpu) == 0 {
            fatal(format_args!("cpu {} left a critical section it did not hold", cpu));
        }
    }

    pub fn irq_holders(&self) -> CpuSet {
        CpuSet::from_bits(self.irqset.load(Ordering::Acquire))
    }
}

/// Guard over the shared scheduler state
///
/// Drop order matters: the spinlock is released before local
/// interrupts are restored.
pub struct CriticalSection<'a, A: Arch, T> {
    arch: &'a A,
    locks: &'a CpuLockState,
    cpu: usize,
    flags: IrqState,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, A: Arch, T> CriticalSection<'a, A, T> {
    /// Disable local interrupts, take the task-list spinlock and mark
    /// this CPU as the holder.
    pub fn enter(arch: &'a A, locks: &'a CpuLockState, data: &'a Mutex<T>) -> Self {
        let flags = arch.irq_save();
        let cpu = arch.this_cpu();
        if locks.irq_holders().contains(cpu) {
            fatal(format_args!("recursive critical section on cpu {}", cpu));
        }
        let guard = data.lock();
        locks.irq_enter(cpu);
        log::trace!("cpu {} entered critical section", cpu);
        Self {
            arch,
            locks,
            cpu,
            flags,
            guard: Some(guard),
        }
    }

    /// CPU that holds this section
    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl<A: Arch, T> Deref for CriticalSection<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(g) => &**g,
            None => fatal(format_args!("critical section used after release")),
        }
    }
}

impl<A: Arch, T> DerefMut for CriticalSection<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(g) => &mut **g,
            None => fatal(format_args!("critical section used after release")),
        }
    }
}

impl<A: Arch, T> Drop for CriticalSection<'_, A, T> {
    fn drop(&mut self) {
        let cpu = self.arch.this_cpu();
        if cpu != self.cpu {
            fatal(format_args!("critical section of cpu {} released by cpu {}", self.cpu, cpu));
        }
        self.locks.irq_leave(self.cpu);
        drop(self.guard.take());
        self.arch.irq_restore(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimArch;

    #[test]
    fn test_lockset() {
        let locks = CpuLockState::new();
        assert!(!locks.is_locked_global());
        locks.lock_cpu(1);
        assert!(locks.is_locked_global());
        assert!(locks.is_locked_by(1));
        assert!(!locks.is_locked_by(0));
        locks.unlock_cpu(1);
        assert!(!locks.is_locked_global());
    }

    #[test]
    fn test_critical_section_masks_irqs() {
        let arch = SimArch::new(2);
        let locks = CpuLockState::new();
        let data = Mutex::new(7u32);
        {
            let mut cs = CriticalSection::enter(&arch, &locks, &data);
            *cs += 1;
            assert!(!arch.irqs_enabled());
            assert!(locks.irq_holders().contains(0));
        }
        assert!(arch.irqs_enabled());
        assert!(locks.irq_holders().is_empty());
        assert_eq!(*data.lock(), 8);
    }

    #[test]
    #[should_panic(expected = "recursive critical section")]
    fn test_recursive_entry_is_fatal() {
        let arch = SimArch::new(1);
        let locks = CpuLockState::new();
        let data = Mutex::new(());
        let _outer = CriticalSection::enter(&arch, &locks, &data);
        let _inner = CriticalSection::enter(&arch, &locks, &data);
    }

    #[test]
    #[should_panic(expected = "did not hold")]
    fn test_foreign_release_is_fatal() {
        let locks = CpuLockState::new();
        locks.irq_enter(0);
        locks.irq_leave(1);
    }

    #[test]
    #[should_panic(expected = "released by cpu 1")]
    fn test_guard_dropped_on_other_cpu_is_fatal() {
        let arch = SimArch::new(2);
        let locks = CpuLockState::new();
        let data = Mutex::new(());
        let cs = CriticalSection::enter(&arch, &locks, &data);
        arch.set_cpu(1);
        drop(cs);
    }
}
