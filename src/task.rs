//! Task control block — the scheduler's record for one task
//!
//! A TCB is owned by exactly one task list at any instant; its
//! `task_state` always names that list. Links to neighbours are pids,
//! never owning references.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use bitflags::bitflags;

use crate::timer::Clock;

/// Maximum CPUs supported by [`CpuSet`]
pub const MAX_CPUS: usize = 32;

/// Number of general-purpose words in a saved resumption context
pub const CONTEXT_REGS: usize = 16;

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority (higher number = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Reserved for the per-CPU idle tasks
    pub const IDLE: Priority = Priority(0);
    /// Lowest priority a normal task may take
    pub const MIN: Priority = Priority(1);
    /// Default for newly created tasks
    pub const DEFAULT: Priority = Priority(100);
    /// Highest priority
    pub const MAX: Priority = Priority(255);
}

/// CPU bitmask (affinity masks, lock holder sets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u32);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every CPU of an `ncpus` system
    pub const fn all(ncpus: usize) -> Self {
        if ncpus >= MAX_CPUS {
            Self(u32::MAX)
        } else {
            Self((1u32 << ncpus) - 1)
        }
    }

    pub const fn single(cpu: usize) -> Self {
        Self(1 << (cpu % MAX_CPUS))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1 << (cpu % MAX_CPUS);
    }

    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !(1 << (cpu % MAX_CPUS));
    }

    pub const fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest CPU in the set
    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub const fn intersect(&self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & other.0)
    }
}

bitflags! {
    /// Attributes of the task list that backs a task state
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListAttr: u8 {
        /// Kept in descending priority order, FIFO among equals
        const PRIORITIZED = 1 << 0;
        /// One list per CPU
        const INDEXED = 1 << 1;
        /// Membership implies eligibility to execute
        const RUNNABLE = 1 << 2;
        /// List storage belongs to the waited-on resource
        const OFFSET = 1 << 3;
    }
}

/// Task execution state
///
/// Each state is backed by exactly one list (see [`TaskState::attrs`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Transient: removed from one list, not yet added to the next.
    /// Never observable outside a critical section.
    Invalid,
    /// Ready, but withheld while preemption is locked
    Pending,
    /// Ready and not assigned to a CPU (SMP), or ready on the single CPU
    ReadyToRun,
    /// Ready and assigned to a CPU but not at its head (SMP only)
    Assigned,
    /// Head of a CPU's ready list
    Running,
    /// Initialized, never activated
    Inactive,
    /// Blocked on a semaphore-like resource
    WaitSem,
    /// Blocked waiting for a signal or a timed wakeup
    WaitSig,
    /// Blocked on a page fill
    WaitFill,
    /// Suspended by a stop request
    Stopped,
}

impl TaskState {
    /// Attributes of the list backing this state
    pub const fn attrs(self) -> ListAttr {
        match self {
            Self::Invalid | Self::Inactive | Self::WaitSig | Self::Stopped => ListAttr::empty(),
            Self::Pending | Self::WaitFill => ListAttr::PRIORITIZED,
            Self::ReadyToRun => ListAttr::PRIORITIZED.union(ListAttr::RUNNABLE),
            Self::Assigned | Self::Running => ListAttr::PRIORITIZED
                .union(ListAttr::INDEXED)
                .union(ListAttr::RUNNABLE),
            Self::WaitSem => ListAttr::PRIORITIZED.union(ListAttr::OFFSET),
        }
    }

    /// Ready-to-run states (runnable lists)
    pub const fn is_ready(self) -> bool {
        self.attrs().contains(ListAttr::RUNNABLE)
    }

    /// States entered through `add_blocked`
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::WaitSem | Self::WaitSig | Self::WaitFill | Self::Stopped)
    }
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Run until blocked or preempted
    Fifo,
    /// Time-sliced among tasks of equal priority
    RoundRobin,
}

/// Opaque identifier of the resource a task waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitObj(pub u16);

/// Asynchronous action delivered on a task's own execution stream
pub type SigDeliver = fn(Pid);

/// Saved resumption point of a suspended task
///
/// Only the fields the dispatcher rewrites are named; the rest of the
/// register frame is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedContext {
    /// Program counter the task resumes at
    pub pc: usize,
    /// Mode / interrupt-mask word restored with the frame
    pub status: u32,
    /// Stack pointer
    pub sp: usize,
    pub regs: [usize; CONTEXT_REGS],
}

/// Primary and secondary context slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XcptContext {
    /// Context restored on the next resumption
    pub regs: SavedContext,
    /// Context parked while an action trampoline runs
    pub saved: Option<SavedContext>,
}

/// Intrusive list links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Link {
    pub prev: Option<Pid>,
    pub next: Option<Pid>,
}

/// Task control block
#[derive(Debug, Clone)]
pub struct Tcb {
    pub pid: Pid,
    /// Task name (8 ASCII chars max)
    pub name: [u8; 8],
    /// Priority without inheritance
    pub base_priority: Priority,
    /// Effective priority, possibly inherited
    pub sched_priority: Priority,
    pub task_state: TaskState,
    /// CPU the task is assigned to, or last ran on
    pub cpu: usize,
    pub affinity: CpuSet,
    /// Reentrant preemption-lock count
    pub lockcount: u16,
    /// Resource the task is blocked on
    pub waitobj: Option<WaitObj>,
    pub xcp: XcptContext,
    /// Action awaiting delivery; set blocks nested delivery
    pub sigdeliver: Option<SigDeliver>,
    pub policy: SchedPolicy,
    /// Remaining round-robin slice in ticks
    pub timeslice: Clock,
    /// Ticks accounted to this task while running
    pub run_ticks: Clock,
    pub(crate) link: Link,
}

impl Tcb {
    /// New inactive task
    pub fn new(pid: Pid, name: &[u8], priority: Priority, affinity: CpuSet) -> Self {
        let mut n = [0u8; 8];
        let len = name.len().min(8);
        n[..len].copy_from_slice(&name[..len]);

        Self {
            pid,
            name: n,
            base_priority: priority,
            sched_priority: priority,
            task_state: TaskState::Inactive,
            cpu: 0,
            affinity,
            lockcount: 0,
            waitobj: None,
            xcp: XcptContext::default(),
            sigdeliver: None,
            policy: SchedPolicy::Fifo,
            timeslice: 0,
            run_ticks: 0,
            link: Link::default(),
        }
    }

    /// Name without trailing padding
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }

    /// CPU the task is pinned to, if its affinity names exactly one
    pub fn pinned_cpu(&self) -> Option<usize> {
        if self.affinity.count() == 1 {
            self.affinity.first()
        } else {
            None
        }
    }

    pub(crate) fn link(&self) -> Link {
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcb_creation() {
        let tcb = Tcb::new(Pid(4), b"sensor", Priority(50), CpuSet::all(2));
        assert_eq!(tcb.task_state, TaskState::Inactive);
        assert_eq!(tcb.name(), b"sensor");
        assert_eq!(tcb.base_priority, tcb.sched_priority);
        assert!(tcb.sigdeliver.is_none());
    }

    #[test]
    fn test_long_name_truncated() {
        let tcb = Tcb::new(Pid(1), b"telemetry-uplink", Priority::DEFAULT, CpuSet::single(0));
        assert_eq!(tcb.name(), b"telemetr");
    }

    #[test]
    fn test_pinned_cpu() {
        let pinned = Tcb::new(Pid(2), b"p", Priority::MIN, CpuSet::single(1));
        let free = Tcb::new(Pid(3), b"f", Priority::MIN, CpuSet::all(4));
        assert_eq!(pinned.pinned_cpu(), Some(1));
        assert_eq!(free.pinned_cpu(), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::MAX > Priority::DEFAULT);
        assert!(Priority::DEFAULT > Priority::MIN);
        assert!(Priority::MIN > Priority::IDLE);
    }

    #[test]
    fn test_cpuset() {
        let mut set = CpuSet::empty();
        set.set(0);
        set.set(3);
        assert_eq!(set.count(), 2);
        assert!(set.contains(3));
        assert!(!set.contains(1));
        set.clear(0);
        assert_eq!(set.first(), Some(3));
        assert_eq!(CpuSet::all(4).bits(), 0b1111);
        assert_eq!(CpuSet::all(32).bits(), u32::MAX);
    }

    #[test]
    fn test_state_attrs() {
        assert!(TaskState::WaitSem.attrs().contains(ListAttr::OFFSET));
        assert!(TaskState::Running.is_ready());
        assert!(!TaskState::Pending.is_ready());
        assert!(TaskState::WaitSig.is_blocked());
        assert!(!TaskState::Inactive.attrs().contains(ListAttr::PRIORITIZED));
    }
}
