//! Hardware timer seam — one-shot alarm abstraction
//!
//! The tickless controller only needs three things from the timer
//! driver: arm for N ticks, read ticks elapsed since arming, and stop.
//! [`SysTimer`] is the software implementation used for testing and
//! hosted builds; on real hardware this wraps SysTick (Cortex-M) or
//! MTIME (RISC-V).
//!
//! Author: Moroya Sakamoto

/// System time in ticks
pub type Clock = u64;

/// One-shot hardware alarm
pub trait HwTimer {
    /// Arm the alarm to fire `ticks` from now, replacing any previous
    /// arming. Elapsed time restarts from zero.
    fn arm(&mut self, ticks: Clock);

    /// Ticks elapsed since the last `arm`
    fn elapsed(&self) -> Clock;

    /// Stop the alarm, returning ticks elapsed since the last `arm`
    fn cancel(&mut self) -> Clock;
}

/// Software one-shot timer
///
/// Size: 32 bytes
#[derive(Debug, Default)]
pub struct SysTimer {
    /// Free-running tick counter
    now: Clock,
    /// Counter value at the last arm/cancel
    armed_at: Clock,
    /// Absolute alarm deadline, if armed
    deadline: Option<Clock>,
    /// Overflow count
    overflows: u32,
}

impl SysTimer {
    /// Software timer for testing
    pub const fn software() -> Self {
        Self {
            now: 0,
            armed_at: 0,
            deadline: None,
            overflows: 0,
        }
    }

    /// Advance time by `ticks`
    ///
    /// Returns true if the alarm deadline was reached; the caller plays
    /// the role of the alarm interrupt.
    pub fn advance(&mut self, ticks: Clock) -> bool {
        let new = self.now.wrapping_add(ticks);
        if new < self.now {
            self.overflows += 1;
        }
        self.now = new;
        self.expired()
    }

    /// Is an armed deadline due?
    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(d) if self.now >= d)
    }

    /// Current counter value
    pub fn now(&self) -> Clock {
        self.now
    }

    /// Ticks left until the armed deadline
    pub fn remaining(&self) -> Option<Clock> {
        self.deadline.map(|d| d.saturating_sub(self.now))
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Number of counter overflows
    pub fn overflows(&self) -> u32 {
        self.overflows
    }
}

impl HwTimer for SysTimer {
    fn arm(&mut self, ticks: Clock) {
        self.armed_at = self.now;
        self.deadline = Some(self.now.saturating_add(ticks));
    }

    fn elapsed(&self) -> Clock {
        self.now.wrapping_sub(self.armed_at)
    }

    fn cancel(&mut self) -> Clock {
        let elapsed = self.elapsed();
        self.armed_at = self.now;
        self.deadline = None;
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_timer() {
        let mut timer = SysTimer::software();
        assert_eq!(timer.now(), 0);
        assert!(!timer.advance(1000));
        assert_eq!(timer.now(), 1000);
    }

    #[test]
    fn test_arm_and_expire() {
        let mut timer = SysTimer::software();
        timer.arm(5);
        assert!(!timer.advance(4));
        assert_eq!(timer.remaining(), Some(1));
        assert!(timer.advance(1));
        assert_eq!(timer.elapsed(), 5);
    }

    #[test]
    fn test_cancel_reports_elapsed() {
        let mut timer = SysTimer::software();
        timer.advance(100);
        timer.arm(10);
        timer.advance(3);
        assert_eq!(timer.cancel(), 3);
        assert!(!timer.is_armed());
        // Elapsed restarts from the cancel point
        timer.advance(2);
        assert_eq!(timer.elapsed(), 2);
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let mut timer = SysTimer::software();
        timer.arm(10);
        timer.advance(4);
        timer.arm(2);
        assert_eq!(timer.remaining(), Some(2));
        assert!(timer.advance(2));
    }

    #[test]
    fn test_overflow() {
        let mut timer = SysTimer::software();
        timer.advance(u64::MAX);
        timer.advance(2);
        assert_eq!(timer.overflows(), 1);
    }
}
