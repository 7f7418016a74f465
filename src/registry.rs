//! Task registry — pid hash table
//!
//! Fixed-size open table indexed by `pid & (size - 1)`. A pid is only
//! handed out when its slot is free, so lookup is a single probe.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use crate::error::{fatal, Result, SchedError};
use crate::task::{Pid, Tcb};

/// Largest pid before allocation wraps
pub const PID_MAX: u32 = i32::MAX as u32;

/// Pid → TCB table
pub struct Registry {
    slots: Vec<Option<Tcb>>,
    /// Last pid handed out
    last_pid: u32,
    /// Pids below this are reserved (idle tasks)
    reserved: u32,
    count: usize,
}

impl Registry {
    /// Create a table with `size` slots (power of two) and `reserved`
    /// low pids kept for the idle tasks.
    pub fn new(size: usize, reserved: u32) -> Result<Self> {
        if !size.is_power_of_two() || size <= reserved as usize {
            return Err(SchedError::InvalidArgument);
        }
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Ok(Self {
            slots,
            last_pid: reserved.saturating_sub(1),
            reserved,
            count: 0,
        })
    }

    #[inline]
    fn hash(&self, pid: Pid) -> usize {
        pid.0 as usize & (self.slots.len() - 1)
    }

    /// Allocate an unused pid
    ///
    /// Probes at most one full table's worth of candidates.
    pub fn alloc_pid(&mut self) -> Result<Pid> {
        for _ in 0..self.slots.len() {
            self.last_pid = if self.last_pid >= PID_MAX {
                self.reserved
            } else {
                self.last_pid + 1
            };
            let candidate = Pid(self.last_pid);
            if self.slots[self.hash(candidate)].is_none() {
                return Ok(candidate);
            }
        }
        log::warn!("pid table full ({} slots)", self.slots.len());
        Err(SchedError::Exhausted)
    }

    /// Register a TCB under its own pid
    pub fn insert(&mut self, tcb: Tcb) -> Result<()> {
        let idx = self.hash(tcb.pid);
        if self.slots[idx].is_some() {
            return Err(SchedError::Exhausted);
        }
        self.slots[idx] = Some(tcb);
        self.count += 1;
        Ok(())
    }

    /// Drop a TCB from the table
    pub fn remove(&mut self, pid: Pid) -> Option<Tcb> {
        let idx = self.hash(pid);
        match &self.slots[idx] {
            Some(tcb) if tcb.pid == pid => {
                self.count -= 1;
                self.slots[idx].take()
            }
            _ => None,
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Tcb> {
        self.slots[self.hash(pid)].as_ref().filter(|t| t.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tcb> {
        let idx = self.hash(pid);
        self.slots[idx].as_mut().filter(|t| t.pid == pid)
    }

    /// Is `pid` a live task?
    pub fn verify(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    /// Lookup for pids reached through list links.
    ///
    /// A dangling link means a corrupted container.
    pub(crate) fn tcb(&self, pid: Pid) -> &Tcb {
        match self.get(pid) {
            Some(tcb) => tcb,
            None => fatal(format_args!("task list links dead pid {}", pid)),
        }
    }

    pub(crate) fn tcb_mut(&mut self, pid: Pid) -> &mut Tcb {
        match self.get_mut(pid) {
            Some(tcb) => tcb,
            None => fatal(format_args!("task list links dead pid {}", pid)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
