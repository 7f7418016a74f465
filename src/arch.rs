//! Architecture layer consumed by the scheduler
//!
//! Implementations live with the port (context-switch assembly, IPIs,
//! interrupt masking). [`crate::sim::SimArch`] is the software port.
//!
//! Author: Moroya Sakamoto

use crate::task::Pid;

/// Saved local interrupt state, returned by `irq_save`
pub type IrqState = usize;

pub trait Arch: Send + Sync {
    /// Index of the executing CPU
    fn this_cpu(&self) -> usize;

    /// Is this CPU currently servicing an interrupt?
    fn in_interrupt(&self) -> bool;

    /// Disable local interrupts, returning the previous state
    fn irq_save(&self) -> IrqState;

    /// Restore a state returned by `irq_save`
    fn irq_restore(&self, state: IrqState);

    /// Save `from`'s context and resume `to` on `cpu`.
    ///
    /// Called only for the executing CPU.
    fn switch_context(&self, cpu: usize, from: Pid, to: Pid);

    /// Stop `cpu` at a safe point so its ready list and its running
    /// task's context may be changed. Returns once the CPU is parked.
    fn pause_cpu(&self, cpu: usize);

    /// Release a CPU parked by `pause_cpu`; it re-reads its ready-list
    /// head and switches if it changed.
    fn resume_cpu(&self, cpu: usize);

    /// Program-counter value of the action-delivery trampoline
    fn sigdeliver_entry(&self) -> usize;

    /// Mode word the trampoline runs with (interrupts masked)
    fn sigdeliver_status(&self) -> u32;
}
