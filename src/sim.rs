//! Software architecture port
//!
//! Records every context switch and CPU pause/resume instead of
//! performing it, so tests can drive several "CPUs" from one thread by
//! selecting the executing CPU with [`SimArch::set_cpu`].
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::{Arch, IrqState};
use crate::task::{Pid, MAX_CPUS};

/// Trampoline address reported by the simulated port
pub const SIM_SIGDELIVER_ENTRY: usize = 0x5160_0000;
/// Trampoline mode word: supervisor, IRQ and FIQ masked
pub const SIM_SIGDELIVER_STATUS: u32 = 0x1f | 0x80 | 0x40;

/// Observable port activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchEvent {
    Switch { cpu: usize, from: Pid, to: Pid },
    Pause(usize),
    Resume(usize),
}

/// Simulated multi-CPU port
pub struct SimArch {
    ncpus: usize,
    cpu: AtomicUsize,
    in_irq: AtomicBool,
    /// Per-CPU interrupt-enable bits (bit set = enabled)
    irq_enabled: AtomicUsize,
    events: Mutex<Vec<ArchEvent>>,
}

impl SimArch {
    pub fn new(ncpus: usize) -> Self {
        let ncpus = ncpus.clamp(1, MAX_CPUS);
        Self {
            ncpus,
            cpu: AtomicUsize::new(0),
            in_irq: AtomicBool::new(false),
            irq_enabled: AtomicUsize::new(usize::MAX),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn ncpus(&self) -> usize {
        self.ncpus
    }

    /// Select the CPU subsequent calls execute on
    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu.min(self.ncpus - 1), Ordering::SeqCst);
    }

    /// Enter or leave simulated interrupt context
    pub fn set_interrupt(&self, active: bool) {
        self.in_irq.store(active, Ordering::SeqCst);
    }

    /// Are interrupts enabled on the executing CPU?
    pub fn irqs_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::SeqCst) & (1 << self.this_cpu()) != 0
    }

    /// Drain recorded events
    pub fn take_events(&self) -> Vec<ArchEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    fn record(&self, event: ArchEvent) {
        self.events.lock().push(event);
    }
}

impl Arch for SimArch {
    fn this_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn in_interrupt(&self) -> bool {
        self.in_irq.load(Ordering::SeqCst)
    }

    fn irq_save(&self) -> IrqState {
        let bit = 1 << self.this_cpu();
        self.irq_enabled.fetch_and(!bit, Ordering::SeqCst) & bit
    }

    fn irq_restore(&self, state: IrqState) {
        self.irq_enabled.fetch_or(state, Ordering::SeqCst);
    }

    fn switch_context(&self, cpu: usize, from: Pid, to: Pid) {
        self.record(ArchEvent::Switch { cpu, from, to });
    }

    fn pause_cpu(&self, cpu: usize) {
        self.record(ArchEvent::Pause(cpu));
    }

    fn resume_cpu(&self, cpu: usize) {
        self.record(ArchEvent::Resume(cpu));
    }

    fn sigdeliver_entry(&self) -> usize {
        SIM_SIGDELIVER_ENTRY
    }

    fn sigdeliver_status(&self) -> u32 {
        SIM_SIGDELIVER_STATUS
    }
}
