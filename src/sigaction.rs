//! Asynchronous action delivery
//!
//! An action runs in the context of its target task. When the target is
//! the caller, outside interrupt context, it runs at once. Otherwise the
//! target's saved context is redirected to the port's delivery
//! trampoline, which calls [`Scheduler::sigdeliver`] and then resumes the
//! interrupted context. A target running on another CPU is paused while
//! its context is rewritten.
//!
//! Author: Moroya Sakamoto

use crate::arch::Arch;
use crate::error::{fatal, Result, SchedError};
use crate::scheduler::Scheduler;
use crate::task::{Pid, SigDeliver, TaskState};

/// How [`Scheduler::schedule_sigaction`] handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The action already ran
    Immediate,
    /// The trampoline runs it when the task next resumes
    Deferred,
    /// An action was already pending; the request was dropped
    Ignored,
}

impl<A: Arch> Scheduler<A> {
    /// Arrange for `deliver` to run in `pid`'s context.
    pub fn schedule_sigaction(&mut self, pid: Pid, deliver: SigDeliver) -> Result<Delivery> {
        let me = self.arch().this_cpu();
        let smp = self.config().is_smp();
        let (running, cpu) = {
            let tcb = self.tcb(pid).ok_or(SchedError::NoSuchTask(pid))?;
            if tcb.sigdeliver.is_some() {
                log::trace!("task {}: action already pending", pid);
                return Ok(Delivery::Ignored);
            }
            (tcb.task_state == TaskState::Running, tcb.cpu)
        };

        let local = running && (!smp || cpu == me);
        if local && !self.arch().in_interrupt() {
            deliver(pid);
            return Ok(Delivery::Immediate);
        }

        let remote = smp && running && cpu != me;
        if remote {
            self.arch().pause_cpu(cpu);
        }

        let entry = self.arch().sigdeliver_entry();
        let status = self.arch().sigdeliver_status();
        if let Some(tcb) = self.tcb_mut(pid) {
            tcb.sigdeliver = Some(deliver);
            tcb.xcp.saved = Some(tcb.xcp.regs);
            tcb.xcp.regs.pc = entry;
            tcb.xcp.regs.status = status;
        }

        if remote {
            self.arch().resume_cpu(cpu);
        }
        log::debug!("task {}: action deferred to trampoline", pid);
        Ok(Delivery::Deferred)
    }

    /// Trampoline body: run the pending action and restore the
    /// interrupted context.
    pub fn sigdeliver(&mut self, pid: Pid) -> Result<()> {
        let deliver = self
            .tcb(pid)
            .ok_or(SchedError::NoSuchTask(pid))?
            .sigdeliver
            .ok_or(SchedError::InvalidArgument)?;

        deliver(pid);

        if let Some(tcb) = self.tcb_mut(pid) {
            let saved = match tcb.xcp.saved.take() {
                Some(saved) => saved,
                None => fatal(format_args!("task {}: pending action without saved context", pid)),
            };
            tcb.sigdeliver = None;
            tcb.xcp.regs = saved;
        }
        Ok(())
    }

    /// Is an action waiting for `pid`'s trampoline?
    pub fn sigaction_pending(&self, pid: Pid) -> bool {
        self.tcb(pid).map_or(false, |tcb| tcb.sigdeliver.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::lock::CpuLockState;
    use crate::sim::{ArchEvent, SimArch, SIM_SIGDELIVER_ENTRY, SIM_SIGDELIVER_STATUS};
    use crate::task::{CpuSet, Priority, SchedPolicy};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn setup(ncpus: usize) -> (Scheduler<SimArch>, Arc<SimArch>) {
        let arch = Arc::new(SimArch::new(ncpus));
        let config = if ncpus > 1 { SchedConfig::smp(ncpus) } else { SchedConfig::uniprocessor() };
        let sched = Scheduler::new(config, arch.clone(), Arc::new(CpuLockState::new())).unwrap();
        (sched, arch)
    }

    fn spawn(sched: &mut Scheduler<SimArch>, prio: u8, affinity: CpuSet) -> Pid {
        let pid = sched.create_task(b"sig", Priority(prio), affinity, SchedPolicy::Fifo).unwrap();
        sched.activate_task(pid).unwrap();
        pid
    }

    static SELF_CALLS: AtomicU32 = AtomicU32::new(0);
    fn count_self(_: Pid) {
        SELF_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_self_delivery_is_immediate() {
        let (mut sched, _) = setup(1);
        let a = spawn(&mut sched, 10, CpuSet::all(1));
        assert_eq!(sched.schedule_sigaction(a, count_self), Ok(Delivery::Immediate));
        assert_eq!(SELF_CALLS.load(Ordering::SeqCst), 1);
        assert!(!sched.sigaction_pending(a));
    }

    static DEFERRED_CALLS: AtomicU32 = AtomicU32::new(0);
    fn count_deferred(_: Pid) {
        DEFERRED_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_ready_task_gets_trampoline() {
        let (mut sched, _) = setup(1);
        let hi = spawn(&mut sched, 20, CpuSet::all(1));
        let lo = spawn(&mut sched, 10, CpuSet::all(1));
        assert_eq!(sched.this_task(), hi);
        sched.tcb_mut(lo).unwrap().xcp.regs.pc = 0x1234;

        assert_eq!(sched.schedule_sigaction(lo, count_deferred), Ok(Delivery::Deferred));
        assert_eq!(DEFERRED_CALLS.load(Ordering::SeqCst), 0);
        let xcp = sched.tcb(lo).unwrap().xcp;
        assert_eq!(xcp.regs.pc, SIM_SIGDELIVER_ENTRY);
        assert_eq!(xcp.regs.status, SIM_SIGDELIVER_STATUS);
        assert_eq!(xcp.saved.map(|r| r.pc), Some(0x1234));

        // Second request while one is pending is dropped
        assert_eq!(sched.schedule_sigaction(lo, count_deferred), Ok(Delivery::Ignored));

        sched.sigdeliver(lo).unwrap();
        assert_eq!(DEFERRED_CALLS.load(Ordering::SeqCst), 1);
        let xcp = sched.tcb(lo).unwrap().xcp;
        assert_eq!(xcp.regs.pc, 0x1234);
        assert!(xcp.saved.is_none());
        assert!(!sched.sigaction_pending(lo));
        assert_eq!(sched.sigdeliver(lo), Err(SchedError::InvalidArgument));
    }

    fn noop(_: Pid) {}

    #[test]
    fn test_interrupted_task_is_deferred() {
        let (mut sched, arch) = setup(1);
        let a = spawn(&mut sched, 10, CpuSet::all(1));
        arch.set_interrupt(true);
        assert_eq!(sched.schedule_sigaction(a, noop), Ok(Delivery::Deferred));
        assert!(sched.sigaction_pending(a));
    }

    #[test]
    fn test_remote_cpu_paused_while_rewriting() {
        let (mut sched, arch) = setup(2);
        let a = spawn(&mut sched, 10, CpuSet::single(1));
        arch.take_events();
        assert_eq!(sched.schedule_sigaction(a, noop), Ok(Delivery::Deferred));
        assert_eq!(arch.take_events(), [ArchEvent::Pause(1), ArchEvent::Resume(1)]);
    }

    #[test]
    fn test_unknown_task() {
        let (mut sched, _) = setup(1);
        assert_eq!(sched.schedule_sigaction(Pid(42), noop), Err(SchedError::NoSuchTask(Pid(42))));
    }
}
