//! Ready-to-run scheduler and task-list engine
//!
//! Every task lives on exactly one list, named by its state:
//!
//! - single CPU: `readytorun` holds every ready task, its head is the
//!   running task and its tail the idle task;
//! - SMP: `assigned[cpu]` holds the tasks bound to each CPU (head
//!   running, tail idle) and `readytorun` holds ready tasks not bound
//!   to any CPU.
//!
//! All methods assume the caller holds the critical section; that is
//! what `&mut self` stands for.
//!
//! Author: Moroya Sakamoto

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::config::SchedConfig;
use crate::error::{fatal, Result, SchedError};
use crate::list::TaskList;
use crate::lock::CpuLockState;
use crate::registry::Registry;
use crate::task::{CpuSet, ListAttr, Pid, Priority, SchedPolicy, TaskState, Tcb};
use crate::timer::Clock;

/// Statically allocated task lists
#[derive(Debug, Default)]
pub struct TaskLists {
    smp: bool,
    /// Ready tasks (single CPU), or ready tasks not bound to a CPU (SMP)
    pub readytorun: TaskList,
    /// Per-CPU ready lists (SMP only)
    pub assigned: Vec<TaskList>,
    /// Ready tasks withheld while preemption is locked
    pub pending: TaskList,
    pub waiting_for_signal: TaskList,
    pub waiting_for_fill: TaskList,
    pub stopped: TaskList,
    pub inactive: TaskList,
}

impl TaskLists {
    fn new(ncpus: usize, smp: bool) -> Self {
        let assigned = if smp {
            (0..ncpus).map(|_| TaskList::new()).collect()
        } else {
            Vec::new()
        };
        Self {
            smp,
            assigned,
            ..Self::default()
        }
    }

    /// List backing `state` on `cpu`.
    ///
    /// `None` for `OFFSET` states (the list belongs to the resource) and
    /// for `Invalid`.
    pub fn get(&self, state: TaskState, cpu: usize) -> Option<&TaskList> {
        match state {
            TaskState::Pending => Some(&self.pending),
            TaskState::ReadyToRun => Some(&self.readytorun),
            TaskState::Assigned if self.smp => self.assigned.get(cpu),
            TaskState::Running if self.smp => self.assigned.get(cpu),
            TaskState::Running => Some(&self.readytorun),
            TaskState::Inactive => Some(&self.inactive),
            TaskState::WaitSig => Some(&self.waiting_for_signal),
            TaskState::WaitFill => Some(&self.waiting_for_fill),
            TaskState::Stopped => Some(&self.stopped),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, state: TaskState, cpu: usize) -> Option<&mut TaskList> {
        match state {
            TaskState::Pending => Some(&mut self.pending),
            TaskState::ReadyToRun => Some(&mut self.readytorun),
            TaskState::Assigned if self.smp => self.assigned.get_mut(cpu),
            TaskState::Running if self.smp => self.assigned.get_mut(cpu),
            TaskState::Running => Some(&mut self.readytorun),
            TaskState::Inactive => Some(&mut self.inactive),
            TaskState::WaitSig => Some(&mut self.waiting_for_signal),
            TaskState::WaitFill => Some(&mut self.waiting_for_fill),
            TaskState::Stopped => Some(&mut self.stopped),
            _ => None,
        }
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Total context switches
    pub context_switches: u64,
    /// Tasks placed on a CPU other than the caller's
    pub remote_placements: u64,
    /// Ticks processed
    pub ticks: Clock,
}

/// Outcome of round-robin accounting for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceResult {
    /// Ticks left in the slice (0 asks for an immediate timer)
    pub remaining: Clock,
    /// The executing CPU must switch context
    pub switch: bool,
}

/// Scheduler instance
pub struct Scheduler<A: Arch> {
    arch: Arc<A>,
    locks: Arc<CpuLockState>,
    config: SchedConfig,
    registry: Registry,
    lists: TaskLists,
    /// Task actually executing on each CPU
    running: Vec<Pid>,
    stats: SchedStats,
}

impl<A: Arch> Scheduler<A> {
    /// Create a scheduler with one idle task per CPU (pids `0..ncpus`)
    pub fn new(config: SchedConfig, arch: Arc<A>, locks: Arc<CpuLockState>) -> Result<Self> {
        config.validate()?;
        let smp = config.is_smp();
        let mut registry = Registry::new(config.npidhash, config.ncpus as u32)?;
        let mut lists = TaskLists::new(config.ncpus, smp);
        let mut running = Vec::with_capacity(config.ncpus);

        for cpu in 0..config.ncpus {
            let pid = Pid(cpu as u32);
            let mut idle = Tcb::new(pid, b"idle", Priority::IDLE, CpuSet::single(cpu));
            idle.task_state = TaskState::Running;
            idle.cpu = cpu;
            registry.insert(idle)?;
            let list = if smp {
                &mut lists.assigned[cpu]
            } else {
                &mut lists.readytorun
            };
            list.push_back(&mut registry, pid);
            running.push(pid);
        }

        log::debug!("scheduler up: {} cpu(s), {} pid slots", config.ncpus, config.npidhash);
        Ok(Self {
            arch,
            locks,
            config,
            registry,
            lists,
            running,
            stats: SchedStats::default(),
        })
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn lock_state(&self) -> &CpuLockState {
        &self.locks
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn lists(&self) -> &TaskLists {
        &self.lists
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    pub fn tcb(&self, pid: Pid) -> Option<&Tcb> {
        self.registry.get(pid)
    }

    pub fn tcb_mut(&mut self, pid: Pid) -> Option<&mut Tcb> {
        self.registry.get_mut(pid)
    }

    fn smp(&self) -> bool {
        self.lists.smp
    }

    fn live(&self, pid: Pid) -> Result<&Tcb> {
        self.registry.get(pid).ok_or(SchedError::NoSuchTask(pid))
    }

    fn prio(&self, pid: Pid) -> Priority {
        self.registry.tcb(pid).sched_priority
    }

    fn set_state(&mut self, pid: Pid, state: TaskState) {
        self.registry.tcb_mut(pid).task_state = state;
    }

    pub fn is_idle(&self, pid: Pid) -> bool {
        (pid.0 as usize) < self.config.ncpus
    }

    // ── CPU queries ─────────────────────────────────────────────────────

    /// Head of `cpu`'s ready list
    pub fn current_task(&self, cpu: usize) -> Pid {
        let head = if self.smp() {
            self.lists.assigned.get(cpu).and_then(|l| l.head())
        } else {
            self.lists.readytorun.head()
        };
        match head {
            Some(pid) => pid,
            None => fatal(format_args!("cpu {} has an empty ready list", cpu)),
        }
    }

    /// Head of the executing CPU's ready list
    pub fn this_task(&self) -> Pid {
        self.current_task(self.arch.this_cpu())
    }

    /// Task whose context is live on the executing CPU.
    ///
    /// Differs from `this_task` inside an interrupt handler that has
    /// changed the ready list but not yet switched.
    pub fn running_task(&self) -> Pid {
        let cpu = self.arch.this_cpu();
        if self.arch.in_interrupt() {
            self.running[cpu]
        } else {
            self.current_task(cpu)
        }
    }

    /// Task executing on `cpu`
    pub fn running_on(&self, cpu: usize) -> Option<Pid> {
        self.running.get(cpu).copied()
    }

    /// Is preemption locked?
    ///
    /// SMP: any CPU holding the lock blocks preemption everywhere.
    /// Single CPU: the running task's lock count decides.
    pub fn is_locked(&self) -> bool {
        if self.smp() {
            self.locks.is_locked_global()
        } else {
            self.registry.tcb(self.this_task()).lockcount > 0
        }
    }

    /// CPU for a task with `affinity`.
    ///
    /// The CPU whose current task has the lowest priority, lowest index
    /// on ties; an idle CPU wins immediately. `None` if no CPU is
    /// allowed.
    pub fn select_cpu(&self, affinity: CpuSet) -> Option<usize> {
        if !self.smp() {
            return Some(0);
        }
        let mut best: Option<(usize, Priority)> = None;
        for cpu in 0..self.config.ncpus {
            if !affinity.contains(cpu) {
                continue;
            }
            let rtcb = self.current_task(cpu);
            if self.is_idle(rtcb) {
                return Some(cpu);
            }
            let prio = self.prio(rtcb);
            if best.map_or(true, |(_, p)| prio < p) {
                best = Some((cpu, prio));
            }
        }
        best.map(|(cpu, _)| cpu)
    }

    /// Park the CPU running `pid` so its state may be changed.
    ///
    /// Returns the paused CPU, or this CPU when no pause was needed.
    pub fn pause_cpu(&self, pid: Pid) -> Result<usize> {
        if !self.smp() {
            return Err(SchedError::NotSupported);
        }
        let tcb = self.live(pid)?;
        let cpu = tcb.cpu;
        if tcb.task_state == TaskState::Running && cpu != self.arch.this_cpu() {
            self.arch.pause_cpu(cpu);
        }
        Ok(cpu)
    }

    /// Release a CPU parked by `pause_cpu`
    pub fn resume_cpu(&self, cpu: usize) -> Result<()> {
        if !self.smp() {
            return Err(SchedError::NotSupported);
        }
        if cpu >= self.config.ncpus {
            return Err(SchedError::InvalidArgument);
        }
        if cpu != self.arch.this_cpu() {
            self.arch.resume_cpu(cpu);
        }
        Ok(())
    }

    /// Make `cpu`'s ready-list head the executing task.
    ///
    /// Performs the architecture switch when they differ and returns
    /// whether it did.
    pub fn switch_if_needed(&mut self, cpu: usize) -> bool {
        let to = self.current_task(cpu);
        let from = self.running[cpu];
        if from == to {
            return false;
        }
        self.running[cpu] = to;
        self.stats.context_switches += 1;

        let rr_interval = self.config.rr_interval;
        let tcb = self.registry.tcb_mut(to);
        // The preemption lock belongs to the task, not the CPU
        if tcb.lockcount > 0 {
            self.locks.lock_cpu(cpu);
        } else {
            self.locks.unlock_cpu(cpu);
        }
        if tcb.policy == SchedPolicy::RoundRobin && tcb.timeslice == 0 {
            tcb.timeslice = rr_interval;
        }

        log::trace!("cpu {}: switch {} -> {}", cpu, from, to);
        self.arch.switch_context(cpu, from, to);
        true
    }

    // ── Ready-to-run ────────────────────────────────────────────────────

    /// Add a task that is on no list to the ready-to-run lists.
    ///
    /// Returns true if the executing CPU must switch context. Other
    /// CPUs are paused and resumed around any change to their list.
    pub fn add_readytorun(&mut self, pid: Pid) -> Result<bool> {
        let state = self.live(pid)?.task_state;
        if state != TaskState::Invalid {
            log::warn!("add_readytorun: task {} still on {:?} list", pid, state);
            return Err(SchedError::WrongState(pid));
        }
        if self.smp() {
            Ok(self.add_readytorun_smp(pid))
        } else {
            Ok(self.add_readytorun_up(pid))
        }
    }

    fn add_readytorun_up(&mut self, pid: Pid) -> bool {
        let rtcb = self.current_task(0);
        let head_locked = self.registry.tcb(rtcb).lockcount > 0;
        self.registry.tcb_mut(pid).cpu = 0;

        if self.prio(pid) > self.prio(rtcb) && head_locked {
            // Would preempt, but the running task holds the lock
            self.lists.pending.add_prioritized(&mut self.registry, pid);
            self.set_state(pid, TaskState::Pending);
            false
        } else if self.lists.readytorun.add_prioritized(&mut self.registry, pid) {
            self.set_state(pid, TaskState::Running);
            self.set_state(rtcb, TaskState::ReadyToRun);
            true
        } else {
            self.set_state(pid, TaskState::ReadyToRun);
            false
        }
    }

    fn add_readytorun_smp(&mut self, pid: Pid) -> bool {
        let me = self.arch.this_cpu();
        let (prio, affinity, pinned) = {
            let tcb = self.registry.tcb(pid);
            (tcb.sched_priority, tcb.affinity, tcb.pinned_cpu())
        };

        let cpu = match pinned.or_else(|| self.select_cpu(affinity)) {
            Some(cpu) => cpu,
            None => fatal(format_args!("task {} has no eligible cpu", pid)),
        };

        let target = if prio > self.prio(self.current_task(cpu)) {
            TaskState::Running
        } else if pinned.is_some() {
            TaskState::Assigned
        } else {
            TaskState::ReadyToRun
        };

        if self.locks.is_locked_global() && target != TaskState::Assigned {
            self.lists.pending.add_prioritized(&mut self.registry, pid);
            self.set_state(pid, TaskState::Pending);
            return false;
        }

        if target == TaskState::ReadyToRun {
            self.lists.readytorun.add_prioritized(&mut self.registry, pid);
            self.set_state(pid, TaskState::ReadyToRun);
            return false;
        }

        if cpu != me {
            self.arch.pause_cpu(cpu);
            self.stats.remote_placements += 1;
        }

        self.registry.tcb_mut(pid).cpu = cpu;
        let switched = self.lists.assigned[cpu].add_prioritized(&mut self.registry, pid);
        if switched {
            self.set_state(pid, TaskState::Running);
            let displaced = match self.registry.tcb(pid).link().next {
                Some(next) => next,
                None => fatal(format_args!("cpu {} lost its idle task", cpu)),
            };
            if self.registry.tcb(displaced).pinned_cpu().is_some() {
                self.set_state(displaced, TaskState::Assigned);
            } else {
                self.lists.assigned[cpu].unlink(&mut self.registry, displaced);
                self.lists.readytorun.add_prioritized(&mut self.registry, displaced);
                self.set_state(displaced, TaskState::ReadyToRun);
            }
            log::debug!("cpu {}: task {} preempts task {}", cpu, pid, displaced);
        } else {
            self.set_state(pid, TaskState::Assigned);
        }

        if cpu != me {
            self.arch.resume_cpu(cpu);
            false
        } else {
            switched
        }
    }

    /// Take a ready, running or pending task off its list.
    ///
    /// The task is left in the transient `Invalid` state; the caller
    /// must add it to another list in the same critical section.
    /// With `merge`, pending tasks are merged if preemption is unlocked.
    /// Returns true if the executing CPU must switch context.
    pub fn remove_readytorun(&mut self, pid: Pid, merge: bool) -> Result<bool> {
        let state = self.live(pid)?.task_state;
        if !state.is_ready() && state != TaskState::Pending {
            return Err(SchedError::WrongState(pid));
        }
        if self.is_idle(pid) {
            log::warn!("refusing to remove idle task {}", pid);
            return Err(SchedError::InvalidArgument);
        }

        let mut doswitch = if self.smp() {
            self.remove_readytorun_smp(pid, state)
        } else {
            self.remove_readytorun_up(pid, state)
        };
        self.set_state(pid, TaskState::Invalid);

        if merge && !self.lists.pending.is_empty() && !self.is_locked() {
            doswitch |= self.merge_pending();
        }
        Ok(doswitch)
    }

    fn remove_readytorun_up(&mut self, pid: Pid, state: TaskState) -> bool {
        let mut doswitch = false;
        if state == TaskState::Running {
            let next = match self.registry.tcb(pid).link().next {
                Some(next) => next,
                None => fatal(format_args!("ready list has no idle task")),
            };
            self.set_state(next, TaskState::Running);
            doswitch = true;
        }
        let list = if state == TaskState::Pending {
            &mut self.lists.pending
        } else {
            &mut self.lists.readytorun
        };
        list.unlink(&mut self.registry, pid);
        doswitch
    }

    fn remove_readytorun_smp(&mut self, pid: Pid, state: TaskState) -> bool {
        let cpu = self.registry.tcb(pid).cpu;
        match state {
            TaskState::Running => {
                let me = self.arch.this_cpu();
                if cpu != me {
                    self.arch.pause_cpu(cpu);
                }

                let mut next = match self.registry.tcb(pid).link().next {
                    Some(next) => next,
                    None => fatal(format_args!("cpu {} lost its idle task", cpu)),
                };
                self.lists.assigned[cpu].unlink(&mut self.registry, pid);

                // Pull in the best unassigned task allowed on this CPU
                let reg = &self.registry;
                let candidate = self
                    .lists
                    .readytorun
                    .iter(reg)
                    .find(|&p| reg.tcb(p).affinity.contains(cpu));
                if let Some(c) = candidate {
                    if self.prio(c) >= self.prio(next) {
                        self.lists.readytorun.unlink(&mut self.registry, c);
                        self.lists.assigned[cpu].push_front(&mut self.registry, c);
                        self.registry.tcb_mut(c).cpu = cpu;
                        next = c;
                    }
                }
                self.set_state(next, TaskState::Running);
                self.registry.tcb_mut(next).cpu = cpu;

                if cpu != me {
                    self.arch.resume_cpu(cpu);
                    false
                } else {
                    true
                }
            }
            TaskState::Assigned => {
                self.lists.assigned[cpu].unlink(&mut self.registry, pid);
                false
            }
            TaskState::Pending => {
                self.lists.pending.unlink(&mut self.registry, pid);
                false
            }
            _ => {
                self.lists.readytorun.unlink(&mut self.registry, pid);
                false
            }
        }
    }

    /// Move pending tasks into the ready-to-run lists.
    ///
    /// Returns true if the executing CPU must switch context.
    pub fn merge_pending(&mut self) -> bool {
        if self.lists.pending.is_empty() {
            return false;
        }

        if self.smp() {
            if self.locks.is_locked_global() {
                return false;
            }
            let mut doswitch = false;
            while let Some(pid) = self.lists.pending.pop_front(&mut self.registry) {
                self.set_state(pid, TaskState::Invalid);
                doswitch |= self.add_readytorun_smp(pid);
            }
            return doswitch;
        }

        let old_head = self.current_task(0);
        self.lists.readytorun.merge_prioritized(
            &mut self.registry,
            &mut self.lists.pending,
            TaskState::ReadyToRun,
        );
        let new_head = self.current_task(0);
        self.set_state(new_head, TaskState::Running);
        if new_head != old_head {
            self.set_state(old_head, TaskState::ReadyToRun);
            true
        } else {
            false
        }
    }

    // ── Blocked lists ───────────────────────────────────────────────────

    fn check_blocked(state: TaskState, has_list: bool) -> Result<()> {
        if !state.is_blocked() {
            return Err(SchedError::InvalidArgument);
        }
        // A list is supplied exactly when the state's list is relocatable
        if state.attrs().contains(ListAttr::OFFSET) != has_list {
            return Err(SchedError::InvalidArgument);
        }
        Ok(())
    }

    /// Put a task that is on no list onto the list for blocked `state`.
    ///
    /// `list` must be given for relocatable (`OFFSET`) states, and only
    /// for those.
    pub fn add_blocked(&mut self, pid: Pid, state: TaskState, list: Option<&mut TaskList>) -> Result<()> {
        Self::check_blocked(state, list.is_some())?;
        if self.live(pid)?.task_state != TaskState::Invalid {
            return Err(SchedError::WrongState(pid));
        }

        let target = match list {
            Some(list) => list,
            None => self
                .lists
                .get_mut(state, 0)
                .ok_or(SchedError::InvalidArgument)?,
        };
        if state.attrs().contains(ListAttr::PRIORITIZED) {
            target.add_prioritized(&mut self.registry, pid);
        } else {
            target.push_back(&mut self.registry, pid);
        }
        self.set_state(pid, state);
        log::trace!("task {} blocked ({:?})", pid, state);
        Ok(())
    }

    /// Take a blocked task off its list, leaving it `Invalid`.
    pub fn remove_blocked(&mut self, pid: Pid, list: Option<&mut TaskList>) -> Result<()> {
        let state = self.live(pid)?.task_state;
        if !state.is_blocked() {
            return Err(SchedError::WrongState(pid));
        }
        Self::check_blocked(state, list.is_some())?;

        match list {
            Some(list) => {
                if !list.remove(&mut self.registry, pid) {
                    return Err(SchedError::InvalidArgument);
                }
            }
            None => match self.lists.get_mut(state, 0) {
                Some(own) => own.unlink(&mut self.registry, pid),
                None => return Err(SchedError::InvalidArgument),
            },
        }
        self.set_state(pid, TaskState::Invalid);
        Ok(())
    }

    /// Block a ready task: off the ready lists, onto the `state` list.
    ///
    /// Returns true if the executing CPU must switch context.
    pub fn block_task(&mut self, pid: Pid, state: TaskState, list: Option<&mut TaskList>) -> Result<bool> {
        Self::check_blocked(state, list.is_some())?;
        let switch = self.remove_readytorun(pid, true)?;
        self.add_blocked(pid, state, list)?;
        Ok(switch)
    }

    /// Make a blocked task ready again.
    pub fn unblock_task(&mut self, pid: Pid, list: Option<&mut TaskList>) -> Result<bool> {
        self.remove_blocked(pid, list)?;
        self.add_readytorun(pid)
    }

    // ── Priority ────────────────────────────────────────────────────────

    /// Change the effective priority, re-sorting the task in its list.
    ///
    /// Tasks blocked on a resource-owned list go through
    /// [`Self::reprioritize_blocked`]. Returns true if the executing CPU
    /// must switch context.
    pub fn reprioritize(&mut self, pid: Pid, prio: Priority) -> Result<bool> {
        let (state, cpu) = {
            let tcb = self.live(pid)?;
            (tcb.task_state, tcb.cpu)
        };
        if self.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }

        match state {
            TaskState::Running | TaskState::ReadyToRun | TaskState::Assigned => {
                Ok(self.reprioritize_rtr(pid, prio))
            }
            TaskState::WaitSem | TaskState::Invalid => Err(SchedError::WrongState(pid)),
            _ if state.attrs().contains(ListAttr::PRIORITIZED) => {
                let list = match self.lists.get_mut(state, cpu) {
                    Some(list) => list,
                    None => return Err(SchedError::WrongState(pid)),
                };
                list.unlink(&mut self.registry, pid);
                self.registry.tcb_mut(pid).sched_priority = prio;
                list.add_prioritized(&mut self.registry, pid);
                Ok(false)
            }
            _ => {
                self.registry.tcb_mut(pid).sched_priority = prio;
                Ok(false)
            }
        }
    }

    /// Re-rank a ready task: remove, change priority, re-add.
    ///
    /// A running task holding the preemption lock keeps its CPU; ready
    /// tasks that now outrank it wait on the pending list.
    pub fn reprioritize_rtr(&mut self, pid: Pid, prio: Priority) -> bool {
        let locked_running = match self.registry.get(pid) {
            Some(tcb) => tcb.task_state == TaskState::Running && tcb.lockcount > 0,
            None => return false,
        };
        if locked_running {
            self.reprioritize_locked(pid, prio);
            return false;
        }

        let mut switch = match self.remove_readytorun(pid, false) {
            Ok(switch) => switch,
            Err(_) => return false,
        };
        self.registry.tcb_mut(pid).sched_priority = prio;
        match self.add_readytorun(pid) {
            Ok(s) => switch |= s,
            Err(e) => fatal(format_args!("task {} lost while re-ranking: {}", pid, e)),
        }
        switch
    }

    fn reprioritize_locked(&mut self, pid: Pid, prio: Priority) {
        let cpu = self.registry.tcb(pid).cpu;
        self.registry.tcb_mut(pid).sched_priority = prio;

        let smp = self.smp();
        let reg = &self.registry;
        let own = if smp { &self.lists.assigned[cpu] } else { &self.lists.readytorun };
        // The running task heads its own list
        let mut outranked: Vec<Pid> = own
            .iter(reg)
            .skip(1)
            .take_while(|&p| reg.tcb(p).sched_priority > prio)
            .collect();
        if smp {
            outranked.extend(
                self.lists
                    .readytorun
                    .iter(reg)
                    .filter(|&p| reg.tcb(p).sched_priority > prio && reg.tcb(p).affinity.contains(cpu)),
            );
        }

        for p in outranked {
            let list = if smp && self.registry.tcb(p).task_state == TaskState::Assigned {
                &mut self.lists.assigned[cpu]
            } else {
                &mut self.lists.readytorun
            };
            list.unlink(&mut self.registry, p);
            self.lists.pending.add_prioritized(&mut self.registry, p);
            self.set_state(p, TaskState::Pending);
            log::debug!("task {} outranks locked task {}, pending", p, pid);
        }
    }

    /// Re-rank a task blocked on a resource-owned list
    pub fn reprioritize_blocked(&mut self, pid: Pid, prio: Priority, list: &mut TaskList) -> Result<()> {
        if self.live(pid)?.task_state != TaskState::WaitSem {
            return Err(SchedError::WrongState(pid));
        }
        if !list.remove(&mut self.registry, pid) {
            return Err(SchedError::InvalidArgument);
        }
        self.registry.tcb_mut(pid).sched_priority = prio;
        list.add_prioritized(&mut self.registry, pid);
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Register a new inactive task
    pub fn create_task(
        &mut self,
        name: &[u8],
        priority: Priority,
        affinity: CpuSet,
        policy: SchedPolicy,
    ) -> Result<Pid> {
        if priority == Priority::IDLE {
            return Err(SchedError::InvalidArgument);
        }
        let affinity = affinity.intersect(CpuSet::all(self.config.ncpus));
        let first_cpu = affinity.first().ok_or(SchedError::InvalidArgument)?;

        let pid = self.registry.alloc_pid()?;
        let mut tcb = Tcb::new(pid, name, priority, affinity);
        tcb.policy = policy;
        tcb.cpu = first_cpu;
        if policy == SchedPolicy::RoundRobin {
            tcb.timeslice = self.config.rr_interval;
        }
        self.registry.insert(tcb)?;
        self.lists.inactive.push_back(&mut self.registry, pid);

        log::debug!(
            "task {} created: prio {} affinity {:#x}",
            pid,
            priority.0,
            affinity.bits()
        );
        Ok(pid)
    }

    /// Move an inactive task to ready-to-run
    pub fn activate_task(&mut self, pid: Pid) -> Result<bool> {
        if self.live(pid)?.task_state != TaskState::Inactive {
            return Err(SchedError::WrongState(pid));
        }
        self.lists.inactive.unlink(&mut self.registry, pid);
        self.set_state(pid, TaskState::Invalid);
        self.add_readytorun(pid)
    }

    /// Remove a task from its list and from the registry.
    ///
    /// Tasks blocked on a resource must be taken off the resource's list
    /// first. Returns true if the executing CPU must switch context.
    pub fn exit_task(&mut self, pid: Pid) -> Result<bool> {
        let state = self.live(pid)?.task_state;
        if self.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }

        let switch = match state {
            s if s.is_ready() || s == TaskState::Pending => self.remove_readytorun(pid, true)?,
            TaskState::WaitSem => return Err(SchedError::WrongState(pid)),
            TaskState::Invalid => false,
            s => {
                let cpu = self.registry.tcb(pid).cpu;
                match self.lists.get_mut(s, cpu) {
                    Some(list) => list.unlink(&mut self.registry, pid),
                    None => return Err(SchedError::WrongState(pid)),
                }
                false
            }
        };
        self.registry.remove(pid);
        log::debug!("task {} exited", pid);
        Ok(switch)
    }

    /// Restrict the CPUs a task may run on, migrating it if needed
    pub fn set_affinity(&mut self, pid: Pid, affinity: CpuSet) -> Result<bool> {
        let affinity = affinity.intersect(CpuSet::all(self.config.ncpus));
        if affinity.is_empty() || self.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }
        let (state, cpu) = {
            let tcb = self.live(pid)?;
            (tcb.task_state, tcb.cpu)
        };
        self.registry.tcb_mut(pid).affinity = affinity;

        let misplaced = matches!(state, TaskState::Running | TaskState::Assigned) && !affinity.contains(cpu);
        let repin = state == TaskState::ReadyToRun && affinity.count() == 1;
        if self.smp() && (misplaced || repin) {
            let mut switch = self.remove_readytorun(pid, false)?;
            switch |= self.add_readytorun(pid)?;
            return Ok(switch);
        }
        Ok(false)
    }

    // ── Stop / continue ─────────────────────────────────────────────────

    /// Stop a task until [`Self::resume`]
    pub fn suspend(&mut self, pid: Pid) -> Result<bool> {
        let state = self.live(pid)?.task_state;
        if self.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }
        let switch = match state {
            TaskState::Stopped => return Ok(false),
            TaskState::WaitSig | TaskState::WaitFill => {
                self.remove_blocked(pid, None)?;
                false
            }
            s if s.is_ready() || s == TaskState::Pending => self.remove_readytorun(pid, false)?,
            _ => return Err(SchedError::WrongState(pid)),
        };
        self.lists.stopped.push_back(&mut self.registry, pid);
        self.set_state(pid, TaskState::Stopped);
        Ok(switch)
    }

    /// Continue a stopped task
    pub fn resume(&mut self, pid: Pid) -> Result<bool> {
        if self.live(pid)?.task_state != TaskState::Stopped {
            return Err(SchedError::WrongState(pid));
        }
        self.lists.stopped.unlink(&mut self.registry, pid);
        self.set_state(pid, TaskState::Invalid);
        self.add_readytorun(pid)
    }

    // ── Preemption lock ─────────────────────────────────────────────────

    /// Disable preemption for the running task (reentrant).
    ///
    /// No-op in interrupt context.
    pub fn sched_lock(&mut self) {
        if self.arch.in_interrupt() {
            return;
        }
        let cpu = self.arch.this_cpu();
        let pid = self.current_task(cpu);
        let tcb = self.registry.tcb_mut(pid);
        tcb.lockcount = match tcb.lockcount.checked_add(1) {
            Some(count) => count,
            None => fatal(format_args!("task {} preemption lock overflow", pid)),
        };
        if tcb.lockcount == 1 {
            self.locks.lock_cpu(cpu);
        }
    }

    /// Undo one `sched_lock`. The last unlock merges pending tasks and
    /// applies a round-robin slice that expired while locked.
    ///
    /// Returns true if the executing CPU must switch context.
    pub fn sched_unlock(&mut self) -> bool {
        if self.arch.in_interrupt() {
            return false;
        }
        let cpu = self.arch.this_cpu();
        let pid = self.current_task(cpu);
        let tcb = self.registry.tcb_mut(pid);
        if tcb.lockcount == 0 {
            log::warn!("sched_unlock: task {} does not hold the lock", pid);
            return false;
        }
        tcb.lockcount -= 1;
        if tcb.lockcount > 0 {
            return false;
        }
        let expired = tcb.policy == SchedPolicy::RoundRobin && tcb.timeslice == 0;
        self.locks.unlock_cpu(cpu);

        let mut switch = false;
        if !self.lists.pending.is_empty() && !self.is_locked() {
            switch |= self.merge_pending();
        }
        if expired && self.config.rr_interval > 0 {
            switch |= self.process_roundrobin(pid, 0, false).switch;
        }
        switch
    }

    // ── Time accounting ─────────────────────────────────────────────────

    /// Charge `ticks` of a running round-robin task's slice.
    ///
    /// An exhausted slice is refilled and, when an equal-priority peer
    /// is ready, the task is moved behind it. With `noswitches` the move
    /// is deferred and a zero remaining slice reported instead.
    pub fn process_roundrobin(&mut self, pid: Pid, ticks: Clock, noswitches: bool) -> SliceResult {
        let rr_interval = self.config.rr_interval;
        let locked = self.registry.tcb(pid).lockcount > 0 || (self.smp() && self.is_locked());
        let tcb = self.registry.tcb_mut(pid);
        let decr = tcb.timeslice.min(ticks);
        tcb.timeslice -= decr;

        let mut result = SliceResult {
            remaining: tcb.timeslice,
            switch: false,
        };
        if tcb.timeslice > 0 || locked {
            return result;
        }

        tcb.timeslice = rr_interval;
        result.remaining = rr_interval;
        let prio = tcb.sched_priority;
        let peer_ready = match tcb.link().next {
            Some(next) => self.prio(next) >= prio,
            None => false,
        };
        if peer_ready {
            if noswitches {
                result.remaining = 0;
            } else {
                result.switch = self.reprioritize_rtr(pid, prio);
                log::trace!("task {} slice expired, rotated", pid);
            }
        }
        result
    }

    /// Account `ticks` to every CPU's running task and run round-robin.
    ///
    /// Returns the smallest remaining round-robin slice (for tickless
    /// rearming) and whether the executing CPU must switch.
    pub fn process_ticks(&mut self, ticks: Clock, noswitches: bool) -> (Option<Clock>, bool) {
        self.stats.ticks += ticks;
        let mut next_slice: Option<Clock> = None;
        let mut switch = false;

        for cpu in 0..self.config.ncpus {
            let pid = self.current_task(cpu);
            let tcb = self.registry.tcb_mut(pid);
            tcb.run_ticks += ticks;
            if tcb.policy != SchedPolicy::RoundRobin || self.config.rr_interval == 0 {
                continue;
            }
            let slice = self.process_roundrobin(pid, ticks, noswitches);
            switch |= slice.switch;
            next_slice = Some(next_slice.map_or(slice.remaining, |n| n.min(slice.remaining)));
            if !self.smp() {
                break;
            }
        }
        (next_slice, switch)
    }

    /// Ticks charged to `pid`, and total ticks processed
    pub fn cpuload(&self, pid: Pid) -> Result<(Clock, Clock)> {
        Ok((self.live(pid)?.run_ticks, self.stats.ticks))
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Check list invariants: ordering, state tags, idle tails, no task
    /// on two ready lists.
    pub fn lists_consistent(&self) -> bool {
        let reg = &self.registry;
        let tagged = |list: &TaskList, ok: &dyn Fn(TaskState) -> bool| {
            list.iter(reg).all(|p| ok(reg.tcb(p).task_state))
        };
        let prioritized = [
            &self.lists.readytorun,
            &self.lists.pending,
            &self.lists.waiting_for_fill,
        ];
        if !prioritized.iter().all(|l| l.is_sorted(reg)) {
            return false;
        }
        if !tagged(&self.lists.pending, &|s| s == TaskState::Pending)
            || !tagged(&self.lists.inactive, &|s| s == TaskState::Inactive)
            || !tagged(&self.lists.waiting_for_signal, &|s| s == TaskState::WaitSig)
            || !tagged(&self.lists.stopped, &|s| s == TaskState::Stopped)
        {
            return false;
        }

        if self.smp() {
            if !tagged(&self.lists.readytorun, &|s| s == TaskState::ReadyToRun) {
                return false;
            }
            for (cpu, list) in self.lists.assigned.iter().enumerate() {
                if !list.is_sorted(reg) || list.tail() != Some(Pid(cpu as u32)) {
                    return false;
                }
                for (i, pid) in list.iter(reg).enumerate() {
                    let tcb = reg.tcb(pid);
                    let want = if i == 0 { TaskState::Running } else { TaskState::Assigned };
                    if tcb.task_state != want || tcb.cpu != cpu {
                        return false;
                    }
                }
            }
        } else {
            let list = &self.lists.readytorun;
            if list.tail() != Some(Pid(0)) {
                return false;
            }
            for (i, pid) in list.iter(reg).enumerate() {
                let want = if i == 0 { TaskState::Running } else { TaskState::ReadyToRun };
                if reg.tcb(pid).task_state != want {
                    return false;
                }
            }
        }
        true
    }
}
