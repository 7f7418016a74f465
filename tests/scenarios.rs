//! End-to-end scheduling scenarios driven through the kernel API

use std::sync::Arc;

use kestrel_rtos::sim::{ArchEvent, SimArch};
use kestrel_rtos::{
    Acquire, CpuSet, Kernel, Pid, Priority, SchedConfig, SchedError, SchedPolicy, SysTimer, TaskState, TimerMode,
    WdogAction, WdogQueue,
};

type SimKernel = Kernel<SimArch, SysTimer>;

fn kernel(config: SchedConfig) -> (SimKernel, Arc<SimArch>) {
    let arch = Arc::new(SimArch::new(config.ncpus));
    let k = Kernel::new(config, arch.clone(), SysTimer::software()).unwrap();
    (k, arch)
}

fn spawn(k: &SimKernel, prio: u8) -> Pid {
    let all = CpuSet::all(k.arch().ncpus());
    k.spawn(b"task", Priority(prio), all, SchedPolicy::Fifo).unwrap()
}

fn noop(_: usize) {}

#[test]
fn watchdogs_fire_in_deadline_order() {
    let mut q = WdogQueue::new();
    let action = WdogAction::Call { func: noop, arg: 0 };
    let w5 = q.create().unwrap();
    let w3 = q.create().unwrap();
    let w10 = q.create().unwrap();
    q.start(w5, 5, action).unwrap();
    q.start(w3, 3, action).unwrap();
    q.start(w10, 10, action).unwrap();

    let order: Vec<_> = q.iter().map(|(id, _)| id).collect();
    assert_eq!(order, [w3, w5, w10]);

    let mut fired = Vec::new();
    q.expire(3, |id, _| fired.push(id));
    assert_eq!(fired, [w3]);
    assert_eq!(q.remaining(w5), Some(2));
    assert_eq!(q.remaining(w10), Some(7));
}

#[test]
fn watchdogs_fire_through_periodic_ticks() {
    let (k, _) = kernel(SchedConfig::uniprocessor());
    let w5 = k.wd_create().unwrap();
    let w3 = k.wd_create().unwrap();
    let w10 = k.wd_create().unwrap();
    k.wd_start(w5, 5, noop, 5).unwrap();
    k.wd_start(w3, 3, noop, 3).unwrap();
    k.wd_start(w10, 10, noop, 10).unwrap();
    for _ in 0..3 {
        k.timer_tick();
    }
    assert_eq!(k.wd_remaining(w3), None);
    assert_eq!(k.wd_remaining(w5), Some(2));
    assert_eq!(k.wd_remaining(w10), Some(7));
}

#[test]
fn watchdogs_fire_tickless() {
    let config = SchedConfig::uniprocessor().with_timer_mode(TimerMode::Tickless);
    let (k, _) = kernel(config);
    let w5 = k.wd_create().unwrap();
    let w3 = k.wd_create().unwrap();
    k.wd_start(w5, 5, noop, 5).unwrap();
    k.wd_start(w3, 3, noop, 3).unwrap();
    // Alarm tracks the head
    assert_eq!(k.with_timer(|t| t.remaining()), Some(3));

    assert!(k.with_timer(|t| t.advance(3)));
    k.timer_expired();
    assert_eq!(k.wd_remaining(w3), None);
    assert_eq!(k.wd_remaining(w5), Some(2));
    assert_eq!(k.with_timer(|t| t.remaining()), Some(2));

    // Cancelling the head re-arms for nothing
    k.wd_cancel(w5).unwrap();
    assert!(!k.with_timer(|t| t.is_armed()));
    assert_eq!(k.clock(), 3);
}

#[test]
fn double_cancel_fails_once() {
    let (k, _) = kernel(SchedConfig::uniprocessor());
    let wd = k.wd_create().unwrap();
    k.wd_start(wd, 4, noop, 0).unwrap();
    assert_eq!(k.wd_cancel(wd), Ok(()));
    let err = k.wd_cancel(wd).unwrap_err();
    assert_eq!(err, SchedError::InvalidArgument);
    assert!(err.errno() < 0);
}

#[test]
fn smp_task_lands_on_lowest_priority_cpu() {
    let (k, arch) = kernel(SchedConfig::smp(2));
    let t10 = spawn(&k, 10);
    let t20 = spawn(&k, 20);
    assert_eq!(k.current_task(0), t10);
    assert_eq!(k.current_task(1), t20);
    arch.take_events();

    let t15 = spawn(&k, 15);
    assert_eq!(k.current_task(0), t15);
    assert_eq!(k.running_task(0), Some(t15));
    assert_eq!(k.task_state(t10), Some(TaskState::ReadyToRun));
    assert_eq!(k.current_task(1), t20);

    let events = arch.take_events();
    assert!(!events.contains(&ArchEvent::Pause(1)));
    assert_eq!(events, [ArchEvent::Switch { cpu: 0, from: t10, to: t15 }]);
}

#[test]
fn smp_blocked_task_frees_cpu_for_unassigned() {
    let (k, _) = kernel(SchedConfig::smp(2));
    let a = spawn(&k, 30);
    let b = spawn(&k, 20);
    let c = spawn(&k, 10);
    assert_eq!(k.task_state(c), Some(TaskState::ReadyToRun));
    assert_eq!(k.running_task(0), Some(a));

    k.sleep(5).unwrap();
    assert_eq!(k.running_task(0), Some(c));
    assert_eq!(k.current_task(1), b);
}

#[test]
fn pending_task_merged_after_unlock() {
    let (k, _) = kernel(SchedConfig::uniprocessor());
    let low = spawn(&k, 10);
    let mid = spawn(&k, 5);
    k.sched_lock();
    let high = spawn(&k, 40);
    assert_eq!(k.task_state(high), Some(TaskState::Pending));
    {
        let core = k.critical();
        let ready: Vec<Pid> = core.sched.lists().readytorun.iter(core.sched.registry()).collect();
        assert!(!ready.contains(&high));
    }

    k.sched_unlock();
    assert_eq!(k.running_task(0), Some(high));
    let core = k.critical();
    let ready: Vec<Pid> = core.sched.lists().readytorun.iter(core.sched.registry()).collect();
    assert_eq!(ready, [high, low, mid, Pid(0)]);
    assert!(core.sched.lists_consistent());
}

#[test]
fn priority_inheritance_tracks_waiters() {
    let (k, _) = kernel(SchedConfig::uniprocessor());
    let res = k.create_resource().unwrap();
    let b = spawn(&k, 5);
    assert_eq!(k.acquire(res), Ok(Acquire::Owned));

    let a = spawn(&k, 10);
    assert!(matches!(k.acquire(res), Ok(Acquire::Blocked { .. })));
    assert_eq!(k.priority(b), Some(Priority(10)));

    let c = spawn(&k, 20);
    k.acquire_timeout(res, 1).unwrap();
    assert_eq!(k.priority(b), Some(Priority(20)));

    // c gives up while a still waits
    k.timer_tick();
    assert_eq!(k.task_state(c), Some(TaskState::Running));
    assert_eq!(k.priority(b), Some(Priority(10)));

    k.suspend(c).unwrap();
    assert_eq!(k.running_task(0), Some(b));
    k.release(res).unwrap();
    assert_eq!(k.priority(b), Some(Priority(5)));
    assert_eq!(k.resource_owner(res), Some(a));
    assert_eq!(k.running_task(0), Some(a));
}

#[test]
fn registry_exhaustion_is_reported() {
    let (k, _) = kernel(SchedConfig::uniprocessor().with_npidhash(4));
    for _ in 0..3 {
        k.create_task(b"t", Priority::DEFAULT, CpuSet::all(1), SchedPolicy::Fifo).unwrap();
    }
    let err = k.create_task(b"t", Priority::DEFAULT, CpuSet::all(1), SchedPolicy::Fifo);
    assert_eq!(err, Err(SchedError::Exhausted));
}

#[test]
fn uniprocessor_pause_not_supported() {
    let (k, _) = kernel(SchedConfig::uniprocessor());
    let core = k.critical();
    assert_eq!(core.sched.pause_cpu(Pid(0)), Err(SchedError::NotSupported));
    assert_eq!(core.sched.select_cpu(CpuSet::all(1)), Some(0));
}

#[test]
fn round_robin_shares_cpu_tickless() {
    let config = SchedConfig::uniprocessor()
        .with_timer_mode(TimerMode::Tickless)
        .with_rr_interval(4);
    let (k, _) = kernel(config);
    let a = k.spawn(b"a", Priority(10), CpuSet::all(1), SchedPolicy::RoundRobin).unwrap();
    let b = k.spawn(b"b", Priority(10), CpuSet::all(1), SchedPolicy::RoundRobin).unwrap();
    assert_eq!(k.running_task(0), Some(a));

    // Arming is driven by the running task's slice
    let wd = k.wd_create().unwrap();
    k.wd_start(wd, 100, noop, 0).unwrap();
    assert_eq!(k.with_timer(|t| t.remaining()), Some(4));

    assert!(k.with_timer(|t| t.advance(4)));
    k.timer_expired();
    assert_eq!(k.running_task(0), Some(b));
    assert_eq!(k.wd_remaining(wd), Some(96));
}
