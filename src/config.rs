//! Scheduler configuration
//!
//! One value per scheduler instance; nothing is global.
//!
//! Author: Moroya Sakamoto

use crate::error::{Result, SchedError};
use crate::task::MAX_CPUS;
use crate::timer::Clock;

/// How time reaches the watchdog queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Periodic interrupt, one tick per call
    Periodic,
    /// One-shot alarm armed for the next needed wakeup
    Tickless,
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// CPUs under this scheduler; 1 selects the single-CPU algorithms
    pub ncpus: usize,
    /// Pid hash size (power of two)
    pub npidhash: usize,
    /// Round-robin slice in ticks (0 disables time slicing)
    pub rr_interval: Clock,
    pub timer_mode: TimerMode,
    /// Priority-inheritance resources that may exist at once
    pub max_resources: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            ncpus: 1,
            npidhash: 32,
            rr_interval: 20,
            timer_mode: TimerMode::Periodic,
            max_resources: 32,
        }
    }
}

impl SchedConfig {
    /// Single-CPU defaults
    pub fn uniprocessor() -> Self {
        Self::default()
    }

    /// Defaults for an `ncpus` SMP system
    pub fn smp(ncpus: usize) -> Self {
        Self {
            ncpus,
            ..Self::default()
        }
    }

    pub fn with_timer_mode(mut self, mode: TimerMode) -> Self {
        self.timer_mode = mode;
        self
    }

    pub fn with_rr_interval(mut self, ticks: Clock) -> Self {
        self.rr_interval = ticks;
        self
    }

    pub fn with_npidhash(mut self, size: usize) -> Self {
        self.npidhash = size;
        self
    }

    /// SMP algorithms in effect?
    pub fn is_smp(&self) -> bool {
        self.ncpus > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.ncpus == 0 || self.ncpus > MAX_CPUS {
            return Err(SchedError::InvalidArgument);
        }
        // Idle tasks take pids 0..ncpus; leave room for at least one more
        if !self.npidhash.is_power_of_two() || self.npidhash <= self.ncpus {
            return Err(SchedError::InvalidArgument);
        }
        if self.max_resources > u16::MAX as usize {
            return Err(SchedError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SchedConfig::default().validate().is_ok());
        assert!(SchedConfig::smp(4).validate().is_ok());
        assert!(!SchedConfig::default().is_smp());
    }

    #[test]
    fn test_rejects_bad_cpu_count() {
        assert!(SchedConfig::smp(0).validate().is_err());
        assert!(SchedConfig::smp(MAX_CPUS + 1).validate().is_err());
    }

    #[test]
    fn test_rejects_bad_hash_size() {
        assert!(SchedConfig::default().with_npidhash(24).validate().is_err());
        assert!(SchedConfig::smp(4).with_npidhash(4).validate().is_err());
    }
}
