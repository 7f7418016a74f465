//! Priority inheritance over owned resources
//!
//! A resource has at most one owner and a prioritized list of waiters
//! (state `WaitSem`). An owner runs at the highest of its base priority
//! and the effective priority of the first waiter of every resource it
//! owns. Changes cascade along owner -> wait object -> owner.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use crate::arch::Arch;
use crate::error::{fatal, Result, SchedError};
use crate::list::TaskList;
use crate::scheduler::Scheduler;
use crate::task::{Pid, Priority, TaskState, WaitObj};

#[derive(Debug, Default)]
struct Resource {
    owner: Option<Pid>,
    waiters: TaskList,
}

/// Outcome of [`PiManager::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now owns the resource
    Owned,
    /// The caller is queued; `switch` as for a blocking call
    Blocked { switch: bool },
}

/// Resource table
#[derive(Debug)]
pub struct PiManager {
    slots: Vec<Option<Resource>>,
}

impl PiManager {
    pub fn new(max_resources: usize) -> Self {
        let mut slots = Vec::with_capacity(max_resources);
        slots.resize_with(max_resources, || None);
        Self { slots }
    }

    fn slot(&self, id: WaitObj) -> Result<&Resource> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SchedError::InvalidArgument)
    }

    fn slot_mut(&mut self, id: WaitObj) -> Result<&mut Resource> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(SchedError::InvalidArgument)
    }

    /// Allocate an unowned resource
    pub fn create(&mut self) -> Result<WaitObj> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SchedError::Exhausted)?;
        self.slots[idx] = Some(Resource::default());
        Ok(WaitObj(idx as u16))
    }

    /// Free a resource nobody owns or waits on
    pub fn destroy(&mut self, id: WaitObj) -> Result<()> {
        let res = self.slot(id)?;
        if let Some(owner) = res.owner {
            return Err(SchedError::WrongState(owner));
        }
        if !res.waiters.is_empty() {
            return Err(SchedError::InvalidArgument);
        }
        self.slots[id.0 as usize] = None;
        Ok(())
    }

    pub fn owner(&self, id: WaitObj) -> Option<Pid> {
        self.slot(id).ok().and_then(|r| r.owner)
    }

    /// Waiters of `id`, highest priority first
    pub fn waiters(&self, id: WaitObj) -> Option<&TaskList> {
        self.slot(id).ok().map(|r| &r.waiters)
    }

    /// Priority `pid` is entitled to: its base, raised by the first
    /// waiter of each resource it owns.
    pub fn inherited_priority<A: Arch>(&self, sched: &Scheduler<A>, pid: Pid) -> Priority {
        let base = sched.tcb(pid).map_or(Priority::IDLE, |t| t.base_priority);
        self.slots
            .iter()
            .flatten()
            .filter(|r| r.owner == Some(pid))
            .filter_map(|r| r.waiters.head())
            .filter_map(|w| sched.tcb(w).map(|t| t.sched_priority))
            .fold(base, core::cmp::max)
    }

    /// Take `id` for the running task `pid`, or block it behind the
    /// owner and boost the owner chain.
    pub fn acquire<A: Arch>(&mut self, sched: &mut Scheduler<A>, id: WaitObj, pid: Pid) -> Result<Acquire> {
        let owner = match self.slot(id)?.owner {
            None => {
                sched.tcb(pid).ok_or(SchedError::NoSuchTask(pid))?;
                self.slot_mut(id)?.owner = Some(pid);
                log::trace!("resource {} taken by {}", id.0, pid);
                return Ok(Acquire::Owned);
            }
            Some(owner) => owner,
        };
        if owner == pid {
            fatal(format_args!("task {} waits on resource {} it owns", pid, id.0));
        }
        self.check_chain(sched, owner, pid);

        let res = self.slot_mut(id)?;
        let mut switch = sched.block_task(pid, TaskState::WaitSem, Some(&mut res.waiters))?;
        if let Some(tcb) = sched.tcb_mut(pid) {
            tcb.waitobj = Some(id);
        }
        switch |= self.propagate(sched, owner);
        Ok(Acquire::Blocked { switch })
    }

    /// Give up `id`; the first waiter (if any) becomes owner and runs.
    pub fn release<A: Arch>(&mut self, sched: &mut Scheduler<A>, id: WaitObj, pid: Pid) -> Result<bool> {
        if self.slot(id)?.owner != Some(pid) {
            return Err(SchedError::WrongState(pid));
        }

        let next = self.slot(id)?.waiters.head();
        self.slot_mut(id)?.owner = next;
        let mut switch = self.propagate(sched, pid);

        if let Some(next) = next {
            let res = self.slot_mut(id)?;
            switch |= sched.unblock_task(next, Some(&mut res.waiters))?;
            if let Some(tcb) = sched.tcb_mut(next) {
                tcb.waitobj = None;
            }
            switch |= self.propagate(sched, next);
            log::debug!("resource {} handed from {} to {}", id.0, pid, next);
        }
        Ok(switch)
    }

    /// Withdraw a waiting task (timeout, signal, exit) and make it ready.
    pub fn cancel_wait<A: Arch>(&mut self, sched: &mut Scheduler<A>, pid: Pid) -> Result<bool> {
        let tcb = sched.tcb(pid).ok_or(SchedError::NoSuchTask(pid))?;
        let id = match (tcb.task_state, tcb.waitobj) {
            (TaskState::WaitSem, Some(id)) => id,
            _ => return Err(SchedError::WrongState(pid)),
        };

        let res = self.slot_mut(id)?;
        let owner = res.owner;
        let mut switch = sched.unblock_task(pid, Some(&mut res.waiters))?;
        if let Some(tcb) = sched.tcb_mut(pid) {
            tcb.waitobj = None;
        }
        if let Some(owner) = owner {
            switch |= self.propagate(sched, owner);
        }
        Ok(switch)
    }

    /// Release everything `pid` owns, e.g. before it exits
    pub fn release_all<A: Arch>(&mut self, sched: &mut Scheduler<A>, pid: Pid) -> Result<bool> {
        let owned: Vec<WaitObj> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, r)| r.as_ref().map_or(false, |r| r.owner == Some(pid)))
            .map(|(i, _)| WaitObj(i as u16))
            .collect();
        let mut switch = false;
        for id in owned {
            switch |= self.release(sched, id, pid)?;
        }
        Ok(switch)
    }

    /// Change `pid`'s base priority; an active boost is kept.
    pub fn set_base_priority<A: Arch>(&mut self, sched: &mut Scheduler<A>, pid: Pid, prio: Priority) -> Result<bool> {
        if prio == Priority::IDLE || sched.is_idle(pid) {
            return Err(SchedError::InvalidArgument);
        }
        sched
            .tcb_mut(pid)
            .ok_or(SchedError::NoSuchTask(pid))?
            .base_priority = prio;
        Ok(self.propagate(sched, pid))
    }

    /// Walk the owner chain from `owner`; reaching `waiter` or running
    /// longer than the task count is a deadlock.
    fn check_chain<A: Arch>(&self, sched: &Scheduler<A>, owner: Pid, waiter: Pid) {
        let limit = sched.registry().len();
        let mut pid = owner;
        for _ in 0..=limit {
            if pid == waiter {
                fatal(format_args!("priority inheritance cycle through task {}", waiter));
            }
            let next = sched
                .tcb(pid)
                .filter(|t| t.task_state == TaskState::WaitSem)
                .and_then(|t| t.waitobj)
                .and_then(|id| self.owner(id));
            match next {
                Some(next) => pid = next,
                None => return,
            }
        }
        fatal(format_args!("priority chain from task {} exceeds task count", owner));
    }

    /// Recompute `pid`'s effective priority and carry the change along
    /// the chain of owners it waits on.
    fn propagate<A: Arch>(&mut self, sched: &mut Scheduler<A>, pid: Pid) -> bool {
        let limit = sched.registry().len();
        let mut pid = pid;
        let mut switch = false;

        for _ in 0..=limit {
            let want = self.inherited_priority(sched, pid);
            let (current, state, waitobj) = match sched.tcb(pid) {
                Some(t) => (t.sched_priority, t.task_state, t.waitobj),
                None => return switch,
            };
            if want == current {
                return switch;
            }
            log::trace!("task {} priority {} -> {}", pid, current.0, want.0);

            let next = match (state, waitobj) {
                (TaskState::WaitSem, Some(id)) => {
                    let res = match self.slot_mut(id) {
                        Ok(res) => res,
                        Err(_) => fatal(format_args!("task {} waits on dead resource {}", pid, id.0)),
                    };
                    if sched.reprioritize_blocked(pid, want, &mut res.waiters).is_err() {
                        fatal(format_args!("task {} missing from resource {}", pid, id.0));
                    }
                    res.owner
                }
                _ => {
                    switch |= sched.reprioritize(pid, want).unwrap_or(false);
                    None
                }
            };
            match next {
                Some(owner) => pid = owner,
                None => return switch,
            }
        }
        fatal(format_args!("priority chain exceeds task count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::lock::CpuLockState;
    use crate::sim::SimArch;
    use crate::task::{CpuSet, SchedPolicy};
    use alloc::sync::Arc;

    fn setup() -> (Scheduler<SimArch>, PiManager) {
        let arch = Arc::new(SimArch::new(1));
        let sched = Scheduler::new(SchedConfig::uniprocessor(), arch, Arc::new(CpuLockState::new())).unwrap();
        (sched, PiManager::new(8))
    }

    fn spawn(sched: &mut Scheduler<SimArch>, prio: u8) -> Pid {
        let pid = sched.create_task(b"pi", Priority(prio), CpuSet::all(1), SchedPolicy::Fifo).unwrap();
        sched.activate_task(pid).unwrap();
        pid
    }

    fn prio(sched: &Scheduler<SimArch>, pid: Pid) -> u8 {
        sched.tcb(pid).unwrap().sched_priority.0
    }

    #[test]
    fn test_release_under_sched_lock_keeps_owner_running() {
        let (mut sched, mut pi) = setup();
        let low = spawn(&mut sched, 5);
        let res = pi.create().unwrap();
        pi.acquire(&mut sched, res, low).unwrap();
        let high = spawn(&mut sched, 20);
        pi.acquire(&mut sched, res, high).unwrap();
        let mid = spawn(&mut sched, 10);
        assert_eq!(sched.this_task(), low);

        sched.sched_lock();
        pi.release(&mut sched, res, low).unwrap();
        assert_eq!(prio(&sched, low), 5);
        assert_eq!(sched.this_task(), low);
        assert!(sched.is_locked());
        assert_eq!(sched.tcb(high).unwrap().task_state, TaskState::Pending);
        assert_eq!(sched.tcb(mid).unwrap().task_state, TaskState::Pending);
        assert!(sched.lists_consistent());

        assert!(sched.sched_unlock());
        assert_eq!(sched.this_task(), high);
        assert_eq!(pi.owner(res), Some(high));
    }

    #[test]
    fn test_boost_and_restore() {
        let (mut sched, mut pi) = setup();
        let low = spawn(&mut sched, 5);
        let res = pi.create().unwrap();
        assert_eq!(pi.acquire(&mut sched, res, low), Ok(Acquire::Owned));

        let mid = spawn(&mut sched, 10);
        assert!(matches!(pi.acquire(&mut sched, res, mid), Ok(Acquire::Blocked { .. })));
        assert_eq!(prio(&sched, low), 10);

        let high = spawn(&mut sched, 20);
        pi.acquire(&mut sched, res, high).unwrap();
        assert_eq!(prio(&sched, low), 20);
        assert_eq!(sched.this_task(), low);

        assert_eq!(pi.release(&mut sched, res, low), Ok(true));
        assert_eq!(prio(&sched, low), 5);
        assert_eq!(pi.owner(res), Some(high));
        assert_eq!(sched.this_task(), high);
        assert_eq!(pi.waiters(res).unwrap().head(), Some(mid));
        assert!(sched.lists_consistent());
    }

    #[test]
    fn test_chain_cascades() {
        let (mut sched, mut pi) = setup();
        let r1 = pi.create().unwrap();
        let r2 = pi.create().unwrap();
        let a = spawn(&mut sched, 5);
        pi.acquire(&mut sched, r1, a).unwrap();
        let b = spawn(&mut sched, 8);
        pi.acquire(&mut sched, r2, b).unwrap();
        // b waits on r1 (owned by a)
        pi.acquire(&mut sched, r1, b).unwrap();
        assert_eq!(prio(&sched, a), 8);

        let c = spawn(&mut sched, 30);
        pi.acquire(&mut sched, r2, c).unwrap();
        assert_eq!(prio(&sched, b), 30);
        assert_eq!(prio(&sched, a), 30);
    }

    #[test]
    fn test_cancel_wait_lowers_owner() {
        let (mut sched, mut pi) = setup();
        let res = pi.create().unwrap();
        let low = spawn(&mut sched, 5);
        pi.acquire(&mut sched, res, low).unwrap();
        let high = spawn(&mut sched, 40);
        pi.acquire(&mut sched, res, high).unwrap();
        assert_eq!(prio(&sched, low), 40);

        assert_eq!(pi.cancel_wait(&mut sched, high), Ok(true));
        assert_eq!(prio(&sched, low), 5);
        assert_eq!(sched.this_task(), high);
        assert_eq!(pi.cancel_wait(&mut sched, high), Err(SchedError::WrongState(high)));
    }

    #[test]
    fn test_base_priority_keeps_boost() {
        let (mut sched, mut pi) = setup();
        let res = pi.create().unwrap();
        let low = spawn(&mut sched, 5);
        pi.acquire(&mut sched, res, low).unwrap();
        let high = spawn(&mut sched, 40);
        pi.acquire(&mut sched, res, high).unwrap();

        pi.set_base_priority(&mut sched, low, Priority(10)).unwrap();
        assert_eq!(prio(&sched, low), 40);
        pi.release(&mut sched, res, low).unwrap();
        assert_eq!(prio(&sched, low), 10);
    }

    #[test]
    fn test_release_requires_owner() {
        let (mut sched, mut pi) = setup();
        let res = pi.create().unwrap();
        let a = spawn(&mut sched, 5);
        assert_eq!(pi.release(&mut sched, res, a), Err(SchedError::WrongState(a)));
        assert_eq!(pi.release(&mut sched, WaitObj(7), a), Err(SchedError::InvalidArgument));
    }

    #[test]
    fn test_destroy_busy_resource() {
        let (mut sched, mut pi) = setup();
        let res = pi.create().unwrap();
        let a = spawn(&mut sched, 5);
        pi.acquire(&mut sched, res, a).unwrap();
        assert_eq!(pi.destroy(res), Err(SchedError::WrongState(a)));
        pi.release(&mut sched, res, a).unwrap();
        assert_eq!(pi.destroy(res), Ok(()));
        assert_eq!(pi.owner(res), None);
    }

    #[test]
    fn test_exhaustion() {
        let mut pi = PiManager::new(1);
        pi.create().unwrap();
        assert_eq!(pi.create(), Err(SchedError::Exhausted));
    }

    #[test]
    #[should_panic(expected = "owns")]
    fn test_self_wait_is_fatal() {
        let (mut sched, mut pi) = setup();
        let res = pi.create().unwrap();
        let a = spawn(&mut sched, 5);
        pi.acquire(&mut sched, res, a).unwrap();
        let _ = pi.acquire(&mut sched, res, a);
    }

    #[test]
    #[should_panic(expected = "cycle")]
    fn test_deadlock_cycle_is_fatal() {
        let (mut sched, mut pi) = setup();
        let r1 = pi.create().unwrap();
        let r2 = pi.create().unwrap();
        let a = spawn(&mut sched, 5);
        let b = spawn(&mut sched, 5);
        pi.acquire(&mut sched, r1, a).unwrap();
        pi.acquire(&mut sched, r2, b).unwrap();
        pi.acquire(&mut sched, r2, a).unwrap();
        let _ = pi.acquire(&mut sched, r1, b);
    }
}
