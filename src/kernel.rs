//! Kernel — entry points for tasks, interrupt handlers and the port
//!
//! Combines scheduler, priority inheritance, watchdog queue and tick
//! source behind one critical section. Every public method enters the
//! section, applies its change, and on the way out switches the
//! executing CPU to its ready-list head if that changed.
//!
//! Author: Moroya Sakamoto

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::Arch;
use crate::config::{SchedConfig, TimerMode};
use crate::error::{Result, SchedError};
use crate::lock::{CpuLockState, CriticalSection};
use crate::pi::{Acquire, PiManager};
use crate::scheduler::Scheduler;
use crate::sigaction::Delivery;
use crate::task::{CpuSet, Pid, Priority, SchedPolicy, SigDeliver, TaskState, WaitObj};
use crate::tickless::{next_interval, TimerController};
use crate::timer::{Clock, HwTimer};
use crate::wdog::{WdogAction, WdogId, WdogQueue};

/// State guarded by the critical section
pub struct KernelCore<A: Arch, T: HwTimer> {
    pub sched: Scheduler<A>,
    pub pi: PiManager,
    pub wdogs: WdogQueue,
    pub timer: TimerController<T>,
    /// Kernel-owned watchdogs bounding a task's wait
    timeouts: Vec<(Pid, WdogId)>,
}

/// Run a fired watchdog action
fn dispatch<A: Arch>(
    sched: &mut Scheduler<A>,
    pi: &mut PiManager,
    wdogs: &mut WdogQueue,
    timeouts: &mut Vec<(Pid, WdogId)>,
    id: WdogId,
    action: WdogAction,
) {
    match action {
        WdogAction::Wakeup(pid) => {
            if sched.tcb(pid).map(|t| t.task_state) == Some(TaskState::WaitSig) {
                if let Err(e) = sched.unblock_task(pid, None) {
                    log::warn!("wakeup of task {} failed: {}", pid, e);
                }
            }
        }
        WdogAction::Timeout(pid) => {
            if sched.tcb(pid).map(|t| t.task_state) == Some(TaskState::WaitSem) {
                log::debug!("task {} wait timed out", pid);
                if let Err(e) = pi.cancel_wait(sched, pid) {
                    log::warn!("timeout of task {} failed: {}", pid, e);
                }
            }
        }
        WdogAction::Call { func, arg } => func(arg),
    }

    if let Some(pos) = timeouts.iter().position(|&(_, w)| w == id) {
        timeouts.swap_remove(pos);
        // Already inactive after firing; only the slot is freed
        let _ = wdogs.delete(id);
    }
}

/// Apply `elapsed` ticks: fire due watchdogs, charge time slices and
/// return the next wakeup the alarm must cover.
fn consume<A: Arch>(
    sched: &mut Scheduler<A>,
    pi: &mut PiManager,
    wdogs: &mut WdogQueue,
    timeouts: &mut Vec<(Pid, WdogId)>,
    elapsed: Clock,
    noswitches: bool,
) -> Option<Clock> {
    if elapsed > 0 {
        let mut fired = Vec::new();
        wdogs.expire(elapsed, |id, action| fired.push((id, action)));
        for (id, action) in fired {
            dispatch(sched, pi, wdogs, timeouts, id, action);
        }
    }
    let (slice, _) = sched.process_ticks(elapsed, noswitches);
    next_interval(wdogs.next_expiry(), slice)
}

impl<A: Arch, T: HwTimer> KernelCore<A, T> {
    /// Tickless: collect elapsed time and re-arm. No-op when periodic.
    pub fn reassess(&mut self, noswitches: bool) {
        let Self {
            sched,
            pi,
            wdogs,
            timer,
            timeouts,
        } = self;
        timer.reassess_timer(|elapsed| consume(sched, pi, wdogs, timeouts, elapsed, noswitches));
    }

    /// Switch the executing CPU to its ready-list head
    pub fn reschedule(&mut self) -> bool {
        let cpu = self.sched.arch().this_cpu();
        self.sched.switch_if_needed(cpu)
    }

    fn start_wdog(&mut self, id: WdogId, delay: Clock, period: Option<Clock>, action: WdogAction) -> Result<()> {
        // Delays count from now: bring the queue up to date first
        self.reassess(true);
        let head = match period {
            Some(period) => self.wdogs.start_periodic(id, delay, period, action)?,
            None => self.wdogs.start(id, delay, action)?,
        };
        if head {
            self.reassess(true);
        }
        Ok(())
    }

    fn cancel_wdog(&mut self, id: WdogId) -> Result<()> {
        if self.wdogs.cancel(id)? {
            self.reassess(true);
        }
        Ok(())
    }

    /// Bound `pid`'s current wait with a kernel-owned watchdog
    fn arm_timeout(&mut self, pid: Pid, ticks: Clock, action: WdogAction) -> Result<()> {
        let id = self.wdogs.create()?;
        self.timeouts.push((pid, id));
        self.start_wdog(id, ticks, None, action)
    }

    fn clear_timeout(&mut self, pid: Pid) {
        if let Some(pos) = self.timeouts.iter().position(|&(p, _)| p == pid) {
            let (_, id) = self.timeouts.swap_remove(pos);
            if self.wdogs.is_active(id) {
                let _ = self.cancel_wdog(id);
            }
            let _ = self.wdogs.delete(id);
        }
    }

    /// Task-context caller: the executing CPU's head, never idle
    fn caller(&self) -> Result<Pid> {
        if self.sched.arch().in_interrupt() {
            log::warn!("blocking call from interrupt context");
            return Err(SchedError::InvalidArgument);
        }
        let pid = self.sched.this_task();
        if self.sched.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }
        Ok(pid)
    }
}

/// Kernel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// System time in ticks
    pub clock: Clock,
    /// Context switches
    pub context_switches: u64,
    /// Tasks placed on another CPU
    pub remote_placements: u64,
    /// Live tasks, idle tasks included
    pub tasks: usize,
    /// Armed watchdogs
    pub active_wdogs: usize,
}

/// Kernel instance
pub struct Kernel<A: Arch, T: HwTimer> {
    arch: Arc<A>,
    locks: Arc<CpuLockState>,
    core: Mutex<KernelCore<A, T>>,
}

impl<A: Arch, T: HwTimer> Kernel<A, T> {
    pub fn new(config: SchedConfig, arch: Arc<A>, timer: T) -> Result<Self> {
        let locks = Arc::new(CpuLockState::new());
        let sched = Scheduler::new(config, arch.clone(), locks.clone())?;
        let core = KernelCore {
            sched,
            pi: PiManager::new(config.max_resources),
            wdogs: WdogQueue::new(),
            timer: TimerController::new(config.timer_mode, timer),
            timeouts: Vec::new(),
        };
        log::debug!("kernel up ({:?} timer)", config.timer_mode);
        Ok(Self {
            arch,
            locks,
            core: Mutex::new(core),
        })
    }

    /// Enter the critical section
    pub fn critical(&self) -> CriticalSection<'_, A, KernelCore<A, T>> {
        CriticalSection::enter(&*self.arch, &self.locks, &self.core)
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Is preemption locked anywhere? Lock-free.
    pub fn is_locked(&self) -> bool {
        self.locks.is_locked_global()
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Register an inactive task
    pub fn create_task(&self, name: &[u8], priority: Priority, affinity: CpuSet, policy: SchedPolicy) -> Result<Pid> {
        self.critical().sched.create_task(name, priority, affinity, policy)
    }

    pub fn activate_task(&self, pid: Pid) -> Result<()> {
        let mut core = self.critical();
        core.sched.activate_task(pid)?;
        core.reschedule();
        Ok(())
    }

    /// Create and activate a task
    pub fn spawn(&self, name: &[u8], priority: Priority, affinity: CpuSet, policy: SchedPolicy) -> Result<Pid> {
        let mut core = self.critical();
        let pid = core.sched.create_task(name, priority, affinity, policy)?;
        core.sched.activate_task(pid)?;
        core.reschedule();
        Ok(pid)
    }

    /// Tear down a task in any state, releasing what it owns
    pub fn exit_task(&self, pid: Pid) -> Result<()> {
        let mut core = self.critical();
        let core = &mut *core;
        let state = core.sched.tcb(pid).ok_or(SchedError::NoSuchTask(pid))?.task_state;
        if core.sched.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }
        core.clear_timeout(pid);
        if state == TaskState::WaitSem {
            core.pi.cancel_wait(&mut core.sched, pid)?;
        }
        core.pi.release_all(&mut core.sched, pid)?;
        core.sched.exit_task(pid)?;
        core.reschedule();
        Ok(())
    }

    pub fn sched_lock(&self) {
        self.critical().sched.sched_lock();
    }

    pub fn sched_unlock(&self) {
        let mut core = self.critical();
        core.sched.sched_unlock();
        core.reschedule();
    }

    /// Head of `cpu`'s ready list
    pub fn current_task(&self, cpu: usize) -> Pid {
        self.critical().sched.current_task(cpu)
    }

    /// Task executing on `cpu`
    pub fn running_task(&self, cpu: usize) -> Option<Pid> {
        self.critical().sched.running_on(cpu)
    }

    pub fn priority(&self, pid: Pid) -> Option<Priority> {
        self.critical().sched.tcb(pid).map(|t| t.sched_priority)
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.critical().sched.tcb(pid).map(|t| t.task_state)
    }

    /// Set the base priority; an inherited boost stays in effect
    pub fn set_priority(&self, pid: Pid, priority: Priority) -> Result<()> {
        let mut core = self.critical();
        let core = &mut *core;
        core.pi.set_base_priority(&mut core.sched, pid, priority)?;
        core.reschedule();
        Ok(())
    }

    pub fn set_affinity(&self, pid: Pid, affinity: CpuSet) -> Result<()> {
        let mut core = self.critical();
        core.sched.set_affinity(pid, affinity)?;
        core.reschedule();
        Ok(())
    }

    pub fn suspend(&self, pid: Pid) -> Result<()> {
        let mut core = self.critical();
        core.sched.suspend(pid)?;
        core.clear_timeout(pid);
        core.reschedule();
        Ok(())
    }

    pub fn resume(&self, pid: Pid) -> Result<()> {
        let mut core = self.critical();
        core.sched.resume(pid)?;
        core.reschedule();
        Ok(())
    }

    /// Ticks charged to `pid`, and total ticks
    pub fn cpuload(&self, pid: Pid) -> Result<(Clock, Clock)> {
        self.critical().sched.cpuload(pid)
    }

    // ── Resources ───────────────────────────────────────────────────────

    pub fn create_resource(&self) -> Result<WaitObj> {
        self.critical().pi.create()
    }

    pub fn destroy_resource(&self, id: WaitObj) -> Result<()> {
        self.critical().pi.destroy(id)
    }

    pub fn resource_owner(&self, id: WaitObj) -> Option<Pid> {
        self.critical().pi.owner(id)
    }

    /// Take `id` for the calling task, blocking behind its owner
    pub fn acquire(&self, id: WaitObj) -> Result<Acquire> {
        let mut core = self.critical();
        let core = &mut *core;
        let pid = core.caller()?;
        let outcome = core.pi.acquire(&mut core.sched, id, pid)?;
        core.reschedule();
        Ok(outcome)
    }

    /// As [`Self::acquire`], giving up after `ticks`
    pub fn acquire_timeout(&self, id: WaitObj, ticks: Clock) -> Result<Acquire> {
        let mut core = self.critical();
        let core = &mut *core;
        let pid = core.caller()?;
        let outcome = core.pi.acquire(&mut core.sched, id, pid)?;
        if let Acquire::Blocked { .. } = outcome {
            core.arm_timeout(pid, ticks, WdogAction::Timeout(pid))?;
        }
        core.reschedule();
        Ok(outcome)
    }

    /// Release `id`, handing it to its first waiter
    pub fn release(&self, id: WaitObj) -> Result<()> {
        let mut core = self.critical();
        let core = &mut *core;
        let pid = core.caller()?;
        core.pi.release(&mut core.sched, id, pid)?;
        if let Some(owner) = core.pi.owner(id) {
            core.clear_timeout(owner);
        }
        core.reschedule();
        Ok(())
    }

    // ── Sleep and watchdogs ─────────────────────────────────────────────

    /// Block the calling task for `ticks`
    pub fn sleep(&self, ticks: Clock) -> Result<()> {
        let mut core = self.critical();
        let pid = core.caller()?;
        core.sched.block_task(pid, TaskState::WaitSig, None)?;
        core.arm_timeout(pid, ticks, WdogAction::Wakeup(pid))?;
        core.reschedule();
        Ok(())
    }

    /// End a sleep early
    pub fn wakeup(&self, pid: Pid) -> Result<()> {
        let mut core = self.critical();
        if core.sched.tcb(pid).map(|t| t.task_state) != Some(TaskState::WaitSig) {
            return Err(SchedError::WrongState(pid));
        }
        core.clear_timeout(pid);
        core.sched.unblock_task(pid, None)?;
        core.reschedule();
        Ok(())
    }

    pub fn wd_create(&self) -> Result<WdogId> {
        self.critical().wdogs.create()
    }

    pub fn wd_delete(&self, id: WdogId) -> Result<()> {
        let mut core = self.critical();
        if core.wdogs.is_active(id) {
            core.cancel_wdog(id)?;
        }
        core.wdogs.delete(id)
    }

    /// Call `func(arg)` after `delay` ticks
    pub fn wd_start(&self, id: WdogId, delay: Clock, func: fn(usize), arg: usize) -> Result<()> {
        let mut core = self.critical();
        core.start_wdog(id, delay, None, WdogAction::Call { func, arg })?;
        core.reschedule();
        Ok(())
    }

    /// Call `func(arg)` after `delay` ticks, then every `period`
    pub fn wd_start_periodic(&self, id: WdogId, delay: Clock, period: Clock, func: fn(usize), arg: usize) -> Result<()> {
        let mut core = self.critical();
        core.start_wdog(id, delay, Some(period), WdogAction::Call { func, arg })?;
        core.reschedule();
        Ok(())
    }

    pub fn wd_cancel(&self, id: WdogId) -> Result<()> {
        self.critical().cancel_wdog(id)
    }

    /// Ticks until `id` fires
    pub fn wd_remaining(&self, id: WdogId) -> Option<Clock> {
        let mut core = self.critical();
        core.reassess(true);
        core.wdogs.remaining(id)
    }

    // ── Time ────────────────────────────────────────────────────────────

    /// Periodic tick interrupt
    pub fn timer_tick(&self) {
        let mut core = self.critical();
        let core = &mut *core;
        if core.timer.mode() != TimerMode::Periodic {
            log::warn!("periodic tick in tickless mode");
            return;
        }
        let ticks = core.timer.process_tick();
        consume(
            &mut core.sched,
            &mut core.pi,
            &mut core.wdogs,
            &mut core.timeouts,
            ticks,
            false,
        );
        core.reschedule();
    }

    /// One-shot alarm interrupt (tickless mode)
    pub fn timer_expired(&self) {
        let mut core = self.critical();
        core.reassess(false);
        core.reschedule();
    }

    /// System time in ticks
    pub fn clock(&self) -> Clock {
        self.critical().timer.clock()
    }

    /// Access the hardware timer (test harnesses drive time through it)
    pub fn with_timer<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.critical().timer.timer_mut())
    }

    // ── Actions and cross-CPU requests ──────────────────────────────────

    /// Deliver `action` in `pid`'s context
    pub fn signal(&self, pid: Pid, action: SigDeliver) -> Result<Delivery> {
        self.critical().sched.schedule_sigaction(pid, action)
    }

    /// Trampoline body for `pid`'s pending action
    pub fn sigdeliver(&self, pid: Pid) -> Result<()> {
        self.critical().sched.sigdeliver(pid)
    }

    /// Reschedule request from another CPU
    pub fn ipi_handler(&self) -> bool {
        self.critical().reschedule()
    }

    pub fn stats(&self) -> KernelStats {
        let core = self.critical();
        let sched = core.sched.stats();
        KernelStats {
            clock: core.timer.clock(),
            context_switches: sched.context_switches,
            remote_placements: sched.remote_placements,
            tasks: core.sched.registry().len(),
            active_wdogs: core.wdogs.len(),
        }
    }
}
