//! Kestrel-RTOS — preemptive SMP scheduling core
//!
//! Task bookkeeping and timing for a small real-time kernel:
//! - Pid registry and intrusive, priority-ordered task lists
//! - Ready-to-run scheduling for one CPU or SMP with affinity
//! - Priority inheritance across chains of owned resources
//! - Delta-encoded watchdog queue, periodic or tickless
//! - Deferred action delivery into a task's own context
//!
//! The port supplies an [`Arch`] (context switch, interrupt masking,
//! CPU pause) and a [`HwTimer`]. [`sim::SimArch`] and [`SysTimer`] are
//! the software versions used for testing.
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod list;
pub mod lock;
pub mod pi;
pub mod registry;
pub mod scheduler;
pub mod sigaction;
pub mod sim;
pub mod task;
pub mod tickless;
pub mod timer;
pub mod wdog;

pub use arch::Arch;
pub use config::{SchedConfig, TimerMode};
pub use error::{Result, SchedError};
pub use kernel::{Kernel, KernelStats};
pub use list::TaskList;
pub use lock::{CpuLockState, CriticalSection};
pub use pi::{Acquire, PiManager};
pub use registry::Registry;
pub use scheduler::{Scheduler, SchedStats};
pub use sigaction::Delivery;
pub use task::{CpuSet, Pid, Priority, SchedPolicy, TaskState, Tcb, WaitObj};
pub use timer::{Clock, HwTimer, SysTimer};
pub use wdog::{WdogAction, WdogId, WdogQueue};
