//! Scheduler error type
//!
//! Non-fatal failures returned to the immediate caller. Invariant
//! violations never come through here: they halt via [`fatal`].
//!
//! Author: Moroya Sakamoto

use core::fmt;

use crate::task::Pid;

/// Non-fatal scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Null, stale or inactive handle, or an argument out of range
    InvalidArgument,
    /// No live task with this pid
    NoSuchTask(Pid),
    /// Operation only meaningful on SMP configurations
    NotSupported,
    /// Identifier or slot space exhausted
    Exhausted,
    /// Task is not in a state the operation accepts
    WrongState(Pid),
}

pub type Result<T> = core::result::Result<T, SchedError>;

const EAGAIN: i32 = 11;
const ESRCH: i32 = 3;
const EINVAL: i32 = 22;
const ENOSYS: i32 = 38;

impl SchedError {
    /// Negated errno value, the status convention of the kernel's C-facing
    /// system-call layer.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument | Self::WrongState(_) => -EINVAL,
            Self::NoSuchTask(_) => -ESRCH,
            Self::NotSupported => -ENOSYS,
            Self::Exhausted => -EAGAIN,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NoSuchTask(pid) => write!(f, "no such task: {}", pid),
            Self::NotSupported => write!(f, "operation not supported on this configuration"),
            Self::Exhausted => write!(f, "identifier space exhausted"),
            Self::WrongState(pid) => write!(f, "task {} is in the wrong state", pid),
        }
    }
}

/// Halt on a scheduler invariant violation.
///
/// Continuing would corrupt scheduling state for every task, so no
/// recovery is attempted.
#[cold]
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("scheduler invariant violated: {}", args);
    panic!("scheduler invariant violated: {}", args)
}
