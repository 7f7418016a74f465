//! Watchdog timer queue
//!
//! Pending timed actions in deadline order, each storing its `lag`: the
//! ticks after its predecessor at which it fires. The sum of lags from
//! the head through an entry is that entry's remaining time, so a tick
//! only touches the head.
//!
//! Author: Moroya Sakamoto

use alloc::vec::Vec;

use crate::error::{Result, SchedError};
use crate::task::Pid;
use crate::timer::Clock;

/// Handle to a watchdog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WdogId(pub u16);

/// What happens when an entry fires
#[derive(Debug, Clone, Copy)]
pub enum WdogAction {
    /// End a sleep: the task leaves its signal wait
    Wakeup(Pid),
    /// Abandon a resource wait
    Timeout(Pid),
    /// Plain callback with an opaque argument
    Call { func: fn(usize), arg: usize },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    action: Option<WdogAction>,
    lag: i64,
    next: Option<WdogId>,
    active: bool,
    period: Option<Clock>,
}

impl Entry {
    const fn new() -> Self {
        Self {
            action: None,
            lag: 0,
            next: None,
            active: false,
            period: None,
        }
    }
}

/// Delta-encoded watchdog queue
#[derive(Debug, Default)]
pub struct WdogQueue {
    slots: Vec<Option<Entry>>,
    head: Option<WdogId>,
    active: usize,
}

impl WdogQueue {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            active: 0,
        }
    }

    fn entry(&self, id: WdogId) -> Result<&Entry> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SchedError::InvalidArgument)
    }

    fn entry_mut(&mut self, id: WdogId) -> Result<&mut Entry> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(SchedError::InvalidArgument)
    }

    /// Allocate an inactive entry
    pub fn create(&mut self) -> Result<WdogId> {
        let idx = match self.slots.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                if self.slots.len() > u16::MAX as usize {
                    return Err(SchedError::Exhausted);
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[idx] = Some(Entry::new());
        Ok(WdogId(idx as u16))
    }

    /// Cancel (if active) and free an entry
    pub fn delete(&mut self, id: WdogId) -> Result<()> {
        if self.entry(id)?.active {
            self.cancel(id)?;
        }
        self.slots[id.0 as usize] = None;
        Ok(())
    }

    /// Schedule `action` `delay` ticks from now.
    ///
    /// An active entry is cancelled first; a delay of 0 fires on the
    /// next tick. Entries with equal deadlines fire in start order.
    /// Returns true if the entry became the head.
    pub fn start(&mut self, id: WdogId, delay: Clock, action: WdogAction) -> Result<bool> {
        if self.entry(id)?.active {
            self.cancel(id)?;
        }
        self.entry_mut(id)?.period = None;
        Ok(self.insert(id, delay.max(1), action))
    }

    /// As [`Self::start`], re-arming every `period` ticks after firing
    pub fn start_periodic(&mut self, id: WdogId, delay: Clock, period: Clock, action: WdogAction) -> Result<bool> {
        if period == 0 {
            return Err(SchedError::InvalidArgument);
        }
        let head = self.start(id, delay, action)?;
        self.entry_mut(id)?.period = Some(period);
        Ok(head)
    }

    fn insert(&mut self, id: WdogId, delay: Clock, action: WdogAction) -> bool {
        let delay = delay.min(i64::MAX as Clock) as i64;
        let mut prev: Option<WdogId> = None;
        let mut cur = self.head;
        let mut acc: i64 = 0;

        while let Some(c) = cur {
            let e = self.node(c);
            if acc + e.lag > delay {
                break;
            }
            acc += e.lag;
            prev = cur;
            cur = e.next;
        }

        let lag = delay - acc;
        if let Some(c) = cur {
            self.node_mut(c).lag -= lag;
        }
        let e = self.node_mut(id);
        e.action = Some(action);
        e.lag = lag;
        e.next = cur;
        e.active = true;
        match prev {
            Some(p) => self.node_mut(p).next = Some(id),
            None => self.head = Some(id),
        }
        self.active += 1;
        log::trace!("wdog {} armed: lag {} after {:?}", id.0, lag, prev.map(|p| p.0));
        prev.is_none()
    }

    /// Stop an active entry; its remaining lag passes to its successor.
    ///
    /// Returns whether it was the head (the alarm needs re-arming).
    /// Inactive or unknown entries are `InvalidArgument`.
    pub fn cancel(&mut self, id: WdogId) -> Result<bool> {
        let e = *self.entry(id)?;
        if !e.active {
            return Err(SchedError::InvalidArgument);
        }

        let mut prev: Option<WdogId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == id {
                break;
            }
            prev = cur;
            cur = self.node(c).next;
        }
        if cur.is_none() {
            crate::error::fatal(format_args!("active wdog {} not queued", id.0));
        }

        if let Some(next) = e.next {
            self.node_mut(next).lag += e.lag;
        }
        match prev {
            Some(p) => self.node_mut(p).next = e.next,
            None => self.head = e.next,
        }
        let node = self.node_mut(id);
        node.next = None;
        node.active = false;
        node.period = None;
        self.active -= 1;
        log::trace!("wdog {} cancelled", id.0);
        Ok(prev.is_none())
    }

    /// Advance time by `ticks`, handing each due entry to `fire`.
    ///
    /// Overshoot past one entry's deadline is carried into the next.
    /// Periodic entries are re-queued. Returns the number fired.
    pub fn expire<F>(&mut self, ticks: Clock, mut fire: F) -> usize
    where
        F: FnMut(WdogId, WdogAction),
    {
        let Some(head) = self.head else {
            return 0;
        };
        self.node_mut(head).lag -= ticks.min(i64::MAX as Clock) as i64;

        let mut fired = 0;
        while let Some(id) = self.head {
            let e = *self.node(id);
            if e.lag > 0 {
                break;
            }
            self.head = e.next;
            if let Some(next) = e.next {
                self.node_mut(next).lag += e.lag;
            }
            let node = self.node_mut(id);
            node.next = None;
            node.active = false;
            self.active -= 1;

            if let Some(action) = e.action {
                fire(id, action);
                fired += 1;
            }
            if let (Some(period), Some(action)) = (e.period, e.action) {
                let delay = (period as i64 + e.lag).max(1) as Clock;
                self.insert(id, delay, action);
                self.node_mut(id).period = Some(period);
            }
        }
        fired
    }

    /// Ticks until `id` fires, if it is active
    pub fn remaining(&self, id: WdogId) -> Option<Clock> {
        if !self.entry(id).ok()?.active {
            return None;
        }
        let mut acc: i64 = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            let e = self.node(c);
            acc += e.lag;
            if c == id {
                return Some(acc.max(0) as Clock);
            }
            cur = e.next;
        }
        None
    }

    /// Ticks until the head fires
    pub fn next_expiry(&self) -> Option<Clock> {
        self.head.map(|h| self.node(h).lag.max(0) as Clock)
    }

    pub fn is_active(&self, id: WdogId) -> bool {
        self.entry(id).map_or(false, |e| e.active)
    }

    /// Active entries
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Active entries in firing order with their lag
    pub fn iter(&self) -> impl Iterator<Item = (WdogId, i64)> + '_ {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            let id = cur?;
            let e = self.node(id);
            cur = e.next;
            Some((id, e.lag))
        })
    }

    fn node(&self, id: WdogId) -> &Entry {
        match self.slots.get(id.0 as usize).and_then(Option::as_ref) {
            Some(e) => e,
            None => crate::error::fatal(format_args!("wdog {} dangling in queue", id.0)),
        }
    }

    fn node_mut(&mut self, id: WdogId) -> &mut Entry {
        match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(e) => e,
            None => crate::error::fatal(format_args!("wdog {} dangling in queue", id.0)),
        }
    }
}
