//! Tick source for the watchdog queue
//!
//! Periodic mode: the port calls the tick handler once per tick and the
//! hardware alarm is never touched here. Tickless mode: the alarm is
//! armed for the next needed wakeup, and elapsed time is collected
//! whenever the queue head may have changed.
//!
//! Author: Moroya Sakamoto

use crate::config::TimerMode;
use crate::timer::{Clock, HwTimer};

/// Earliest of two optional intervals
pub fn next_interval(a: Option<Clock>, b: Option<Clock>) -> Option<Clock> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Hardware alarm bookkeeping
#[derive(Debug)]
pub struct TimerController<T: HwTimer> {
    mode: TimerMode,
    timer: T,
    clock: Clock,
}

impl<T: HwTimer> TimerController<T> {
    pub fn new(mode: TimerMode, timer: T) -> Self {
        Self {
            mode,
            timer,
            clock: 0,
        }
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    /// System time in ticks
    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    /// Stop the alarm and return the ticks elapsed since it was armed.
    ///
    /// Always 0 in periodic mode, where ticks arrive one at a time.
    pub fn cancel_timer(&mut self) -> Clock {
        if self.mode == TimerMode::Periodic {
            return 0;
        }
        let elapsed = self.timer.cancel();
        self.clock += elapsed;
        elapsed
    }

    /// Arm the alarm for `next` ticks; `None` leaves it stopped.
    pub fn resume_timer(&mut self, next: Option<Clock>) {
        if self.mode == TimerMode::Periodic {
            return;
        }
        match next {
            Some(ticks) => {
                self.timer.arm(ticks.max(1));
                log::trace!("alarm armed for {} ticks", ticks.max(1));
            }
            None => log::trace!("alarm idle"),
        }
    }

    /// Collect elapsed time, let `on_elapsed` consume it and name the
    /// next wakeup, then re-arm.
    ///
    /// Returns the elapsed ticks. No-op in periodic mode.
    pub fn reassess_timer<F>(&mut self, on_elapsed: F) -> Clock
    where
        F: FnOnce(Clock) -> Option<Clock>,
    {
        if self.mode == TimerMode::Periodic {
            return 0;
        }
        let elapsed = self.cancel_timer();
        let next = on_elapsed(elapsed);
        self.resume_timer(next);
        elapsed
    }

    /// One periodic tick
    pub fn process_tick(&mut self) -> Clock {
        self.clock += 1;
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::SysTimer;

    #[test]
    fn test_periodic_ignores_alarm() {
        let mut ctl = TimerController::new(TimerMode::Periodic, SysTimer::software());
        ctl.resume_timer(Some(5));
        assert!(!ctl.timer().is_armed());
        assert_eq!(ctl.cancel_timer(), 0);
        assert_eq!(ctl.reassess_timer(|_| panic!("not called")), 0);
        ctl.process_tick();
        ctl.process_tick();
        assert_eq!(ctl.clock(), 2);
    }

    #[test]
    fn test_tickless_reassess() {
        let mut ctl = TimerController::new(TimerMode::Tickless, SysTimer::software());
        ctl.resume_timer(Some(10));
        ctl.timer_mut().advance(4);
        let elapsed = ctl.reassess_timer(|e| {
            assert_eq!(e, 4);
            Some(6)
        });
        assert_eq!(elapsed, 4);
        assert_eq!(ctl.clock(), 4);
        assert_eq!(ctl.timer().remaining(), Some(6));
    }

    #[test]
    fn test_tickless_idle_leaves_alarm_off() {
        let mut ctl = TimerController::new(TimerMode::Tickless, SysTimer::software());
        ctl.resume_timer(None);
        assert!(!ctl.timer().is_armed());
        ctl.resume_timer(Some(0));
        assert_eq!(ctl.timer().remaining(), Some(1));
    }

    #[test]
    fn test_next_interval() {
        assert_eq!(next_interval(Some(3), Some(5)), Some(3));
        assert_eq!(next_interval(None, Some(5)), Some(5));
        assert_eq!(next_interval(None, None), None);
    }
}
