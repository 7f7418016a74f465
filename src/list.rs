//! Intrusive task lists
//!
//! A [`TaskList`] holds only head, tail and length; the links live in
//! the TCBs, so every mutation borrows the [`Registry`] alongside the
//! list. Lists never own TCBs.
//!
//! Author: Moroya Sakamoto

use crate::registry::Registry;
use crate::task::{Link, Pid, TaskState};

/// Doubly linked sequence of tasks
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TaskList {
    head: Option<Pid>,
    tail: Option<Pid>,
    len: usize,
}

impl TaskList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn head(&self) -> Option<Pid> {
        self.head
    }

    pub fn tail(&self) -> Option<Pid> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Walk the list from head to tail
    pub fn iter<'a>(&self, reg: &'a Registry) -> Iter<'a> {
        Iter {
            reg,
            cursor: self.head,
        }
    }

    /// Membership test by walking the list
    pub fn contains(&self, reg: &Registry, pid: Pid) -> bool {
        self.iter(reg).any(|p| p == pid)
    }

    pub fn push_front(&mut self, reg: &mut Registry, pid: Pid) {
        let old = self.head;
        reg.tcb_mut(pid).link = Link { prev: None, next: old };
        match old {
            Some(h) => reg.tcb_mut(h).link.prev = Some(pid),
            None => self.tail = Some(pid),
        }
        self.head = Some(pid);
        self.len += 1;
    }

    pub fn push_back(&mut self, reg: &mut Registry, pid: Pid) {
        let old = self.tail;
        reg.tcb_mut(pid).link = Link { prev: old, next: None };
        match old {
            Some(t) => reg.tcb_mut(t).link.next = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    /// Insert `pid` immediately before `at`, which must be a member
    pub fn insert_before(&mut self, reg: &mut Registry, at: Pid, pid: Pid) {
        let prev = reg.tcb(at).link().prev;
        match prev {
            None => self.push_front(reg, pid),
            Some(p) => {
                reg.tcb_mut(pid).link = Link {
                    prev: Some(p),
                    next: Some(at),
                };
                reg.tcb_mut(p).link.next = Some(pid);
                reg.tcb_mut(at).link.prev = Some(pid);
                self.len += 1;
            }
        }
    }

    /// Unlink `pid` without checking membership
    ///
    /// Callers must already know `pid` is on this list.
    pub(crate) fn unlink(&mut self, reg: &mut Registry, pid: Pid) {
        let Link { prev, next } = reg.tcb(pid).link();
        match prev {
            Some(p) => reg.tcb_mut(p).link.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => reg.tcb_mut(n).link.prev = prev,
            None => self.tail = prev,
        }
        reg.tcb_mut(pid).link = Link::default();
        self.len -= 1;
    }

    /// Remove `pid`; false if it is not a member
    pub fn remove(&mut self, reg: &mut Registry, pid: Pid) -> bool {
        if !reg.verify(pid) || !self.contains(reg, pid) {
            return false;
        }
        self.unlink(reg, pid);
        true
    }

    pub fn pop_front(&mut self, reg: &mut Registry) -> Option<Pid> {
        let head = self.head?;
        self.unlink(reg, head);
        Some(head)
    }

    /// Insert in descending priority order, after every task of equal
    /// priority.
    ///
    /// Returns true if `pid` became the new head.
    pub fn add_prioritized(&mut self, reg: &mut Registry, pid: Pid) -> bool {
        let prio = reg.tcb(pid).sched_priority;

        let mut cursor = self.head;
        while let Some(c) = cursor {
            if reg.tcb(c).sched_priority < prio {
                break;
            }
            cursor = reg.tcb(c).link().next;
        }

        match cursor {
            Some(at) => {
                let at_head = self.head == Some(at);
                self.insert_before(reg, at, pid);
                at_head
            }
            None => {
                let was_empty = self.is_empty();
                self.push_back(reg, pid);
                was_empty
            }
        }
    }

    /// Move every task of `from` into this prioritized list, tagging each
    /// with `state`. `from` is left empty.
    pub fn merge_prioritized(&mut self, reg: &mut Registry, from: &mut TaskList, state: TaskState) {
        while let Some(pid) = from.pop_front(reg) {
            reg.tcb_mut(pid).task_state = state;
            self.add_prioritized(reg, pid);
        }
    }

    /// Is the list in descending priority order?
    pub fn is_sorted(&self, reg: &Registry) -> bool {
        let mut last = None;
        for pid in self.iter(reg) {
            let prio = reg.tcb(pid).sched_priority;
            if matches!(last, Some(l) if l < prio) {
                return false;
            }
            last = Some(prio);
        }
        true
    }
}

/// Head-to-tail iterator over a [`TaskList`]
pub struct Iter<'a> {
    reg: &'a Registry,
    cursor: Option<Pid>,
}

impl Iterator for Iter<'_> {
    type Item = Pid;

    fn next(&mut self) -> Option<Pid> {
        let pid = self.cursor?;
        self.cursor = self.reg.tcb(pid).link().next;
        Some(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CpuSet, Priority, Tcb};
    use alloc::vec::Vec;

    fn registry_with(prios: &[u8]) -> (Registry, Vec<Pid>) {
        let mut reg = Registry::new(32, 1).unwrap();
        let pids = prios
            .iter()
            .map(|&p| {
                let pid = reg.alloc_pid().unwrap();
                reg.insert(Tcb::new(pid, b"t", Priority(p), CpuSet::all(1)))
                    .unwrap();
                pid
            })
            .collect();
        (reg, pids)
    }

    fn collect(list: &TaskList, reg: &Registry) -> Vec<Pid> {
        list.iter(reg).collect()
    }

    #[test]
    fn test_push_and_pop() {
        let (mut reg, p) = registry_with(&[1, 1, 1]);
        let mut list = TaskList::new();
        list.push_back(&mut reg, p[0]);
        list.push_back(&mut reg, p[1]);
        list.push_front(&mut reg, p[2]);
        assert_eq!(collect(&list, &reg), [p[2], p[0], p[1]]);
        assert_eq!(list.pop_front(&mut reg), Some(p[2]));
        assert_eq!(list.len(), 2);
        assert_eq!(list.tail(), Some(p[1]));
    }

    #[test]
    fn test_prioritized_fifo_among_equals() {
        let (mut reg, p) = registry_with(&[10, 20, 10, 20, 5]);
        let mut list = TaskList::new();
        for &pid in &p {
            list.add_prioritized(&mut reg, pid);
        }
        assert_eq!(collect(&list, &reg), [p[1], p[3], p[0], p[2], p[4]]);
        assert!(list.is_sorted(&reg));
    }

    #[test]
    fn test_prioritized_reports_new_head() {
        let (mut reg, p) = registry_with(&[10, 5, 10, 30]);
        let mut list = TaskList::new();
        assert!(list.add_prioritized(&mut reg, p[0]));
        assert!(!list.add_prioritized(&mut reg, p[1]));
        // Equal priority queues behind the head
        assert!(!list.add_prioritized(&mut reg, p[2]));
        assert!(list.add_prioritized(&mut reg, p[3]));
    }

    #[test]
    fn test_remove_non_member() {
        let (mut reg, p) = registry_with(&[1, 2]);
        let mut a = TaskList::new();
        let mut b = TaskList::new();
        a.push_back(&mut reg, p[0]);
        b.push_back(&mut reg, p[1]);
        assert!(!a.remove(&mut reg, p[1]));
        assert!(!a.remove(&mut reg, Pid(999)));
        assert!(a.remove(&mut reg, p[0]));
        assert!(a.is_empty());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_remove_middle_relinks() {
        let (mut reg, p) = registry_with(&[3, 2, 1]);
        let mut list = TaskList::new();
        for &pid in &p {
            list.add_prioritized(&mut reg, pid);
        }
        assert!(list.remove(&mut reg, p[1]));
        assert_eq!(collect(&list, &reg), [p[0], p[2]]);
        assert_eq!(reg.get(p[2]).unwrap().link().prev, Some(p[0]));
    }

    #[test]
    fn test_merge_prioritized() {
        let (mut reg, p) = registry_with(&[50, 10, 30, 30]);
        let mut ready = TaskList::new();
        let mut pending = TaskList::new();
        ready.add_prioritized(&mut reg, p[0]);
        ready.add_prioritized(&mut reg, p[1]);
        pending.add_prioritized(&mut reg, p[2]);
        pending.add_prioritized(&mut reg, p[3]);
        ready.merge_prioritized(&mut reg, &mut pending, TaskState::ReadyToRun);
        assert!(pending.is_empty());
        assert_eq!(collect(&ready, &reg), [p[0], p[2], p[3], p[1]]);
        assert_eq!(reg.get(p[2]).unwrap().task_state, TaskState::ReadyToRun);
    }
}
