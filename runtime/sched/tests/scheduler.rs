//! Yield decisions, sleeping and the scheduler's life as a driver
//!
//! Context switches are no-ops on the host, so these tests follow which
//! thread the scheduler believes is on the CPU.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{weighted, Fixture};
use keel_drivers::{DriverError, LifecycleState};
use keel_sched::*;

#[test]
fn test_start_arms_backoff() {
    let fixture = weighted();
    assert_eq!(fixture.registry.state(fixture.timer_id), Some(LifecycleState::Active));
    assert_eq!(fixture.timer.armed(), 100_000);
    assert_eq!(fixture.scheduler.driver_id(), Some(fixture.scheduler_id));
    assert_eq!(fixture.scheduler.now(), Ok(0));
}

#[test]
fn test_weighted_slices_follow_priority() {
    let fixture = weighted();
    let low = fixture.spawn(100);
    let high = fixture.spawn(300);

    assert_eq!(fixture.scheduler.total_active_priority(), 400);
    let low_slice = fixture.scheduler.slice_for(low).unwrap();
    let high_slice = fixture.scheduler.slice_for(high).unwrap();
    assert_eq!(high_slice, 3 * low_slice);

    // Each switch arms the incoming thread's own slice.
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(low));
    assert_eq!(fixture.timer.armed(), 15_000);

    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(high));
    assert_eq!(fixture.timer.armed(), 45_000);
}

#[test]
fn test_process_priority_change() {
    let fixture = weighted();
    fixture.spawn(100);
    fixture.spawn(300);

    fixture.kernel.set_priority(2);
    fixture.scheduler.priorities_changed();
    assert_eq!(fixture.scheduler.total_active_priority(), 800);

    let id = fixture.spawn(50);
    assert_eq!(fixture.scheduler.total_active_priority(), 900);
    fixture.scheduler.set_thread_priority(id, 150).unwrap();
    assert_eq!(fixture.scheduler.total_active_priority(), 1_100);
}

#[test]
fn test_single_runnable_thread_backs_off() {
    let fixture = weighted();
    let boot = fixture.adopt_boot();

    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(boot));
    assert_eq!(fixture.timer.armed(), 100_000);
    assert_eq!(fixture.scheduler.switch_count(), 0);
}

#[test]
fn test_round_robin_has_no_starvation() {
    let fixture = weighted();
    let boot = fixture.adopt_boot();
    let threads = [boot, fixture.spawn(100), fixture.spawn(100), fixture.spawn(100)];

    let mut last_seen: HashMap<ThreadId, usize> = HashMap::new();
    for round in 0..40 {
        fixture.scheduler.yield_now();
        let current = fixture.scheduler.current_thread().unwrap();
        if let Some(previous) = last_seen.insert(current, round) {
            assert!(round - previous <= threads.len(), "{} waited too long", current);
        }
    }
    assert_eq!(last_seen.len(), threads.len());
    assert_eq!(fixture.scheduler.switch_count(), 40);
}

#[test]
fn test_sleep_wakes_exactly_at_deadline() {
    let fixture = weighted();
    let boot = fixture.adopt_boot();
    let other = fixture.spawn(100);
    fixture.timer.set(5_000);

    fixture.scheduler.sleep_thread(boot, 1_000).unwrap();
    assert_eq!(fixture.scheduler.thread_state(boot), Some(ThreadState::Sleeping));
    assert_eq!(fixture.scheduler.current_thread(), Some(other));
    assert_eq!(
        fixture.scheduler.with_thread(boot, Thread::wake_at),
        Some(6_000)
    );

    fixture.timer.set(5_999);
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.thread_state(boot), Some(ThreadState::Sleeping));
    assert_eq!(fixture.scheduler.current_thread(), Some(other));

    fixture.timer.set(6_000);
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.thread_state(boot), Some(ThreadState::Active));
    assert_eq!(fixture.scheduler.current_thread(), Some(boot));
}

#[test]
fn test_sleepers_wake_in_deadline_order() {
    let fixture = weighted();
    fixture.adopt_boot();
    let a = fixture.spawn(100);
    let b = fixture.spawn(100);
    let c = fixture.spawn(100);

    fixture.scheduler.sleep_thread(a, 300).unwrap();
    fixture.scheduler.sleep_thread(b, 100).unwrap();
    fixture.scheduler.sleep_thread(c, 300).unwrap();
    assert_eq!(fixture.scheduler.sleeping_threads(), vec![b, a, c]);

    fixture.timer.set(300);
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(b));
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(a));
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(c));
}

#[test]
fn test_idle_when_nothing_is_runnable() {
    let fixture = weighted();
    let boot = fixture.adopt_boot();

    fixture.scheduler.pause_thread(boot).unwrap();
    assert!(fixture.scheduler.is_idle());
    assert_eq!(fixture.scheduler.current_thread(), None);
    assert_eq!(fixture.timer.armed(), 100_000);

    // Staying idle is not a switch.
    let switches = fixture.scheduler.switch_count();
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.switch_count(), switches);

    fixture.scheduler.resume_thread(boot).unwrap();
    fixture.scheduler.yield_now();
    assert!(!fixture.scheduler.is_idle());
    assert_eq!(fixture.scheduler.current_thread(), Some(boot));
}

#[test]
fn test_deferred_yield_runs_on_unlock() {
    let fixture = weighted();
    fixture.adopt_boot();
    let other = fixture.spawn(100);

    {
        let _guard = PreemptionGuard::new(fixture.scheduler.as_ref());
        fixture.scheduler.yield_now();
        fixture.scheduler.yield_now();
        assert_eq!(fixture.scheduler.switch_count(), 0);
        assert_eq!(fixture.scheduler.deferred_yields(), 2);
    }

    // Exactly one yield ran for the two requests.
    assert_eq!(fixture.scheduler.switch_count(), 1);
    assert_eq!(fixture.scheduler.current_thread(), Some(other));
    assert_eq!(fixture.scheduler.deferred_yields(), 0);
}

#[test]
fn test_unknown_threads_are_reported() {
    let fixture = weighted();
    let id = fixture.spawn(100);
    let removed = fixture.scheduler.remove_thread(id).unwrap();
    assert_eq!(removed.priority(), 100);

    let missing = SchedulerError::ThreadNotFound { thread: id };
    assert_eq!(fixture.scheduler.pause_thread(id), Err(missing.clone()));
    assert_eq!(fixture.scheduler.resume_thread(id), Err(missing.clone()));
    assert_eq!(fixture.scheduler.terminate_thread(id), Err(missing.clone()));
    assert_eq!(fixture.scheduler.sleep_thread(id, 5), Err(missing.clone()));
    assert_eq!(fixture.scheduler.set_thread_priority(id, 5), Err(missing));
    assert_eq!(fixture.scheduler.thread_state(id), None);
}

#[test]
fn test_scheduler_refuses_to_stop() {
    let fixture = weighted();
    assert_eq!(
        fixture.registry.stop_driver(fixture.scheduler_id),
        Err(DriverError::StopRefused { driver: "cpuScheduler" })
    );
    assert_eq!(
        fixture.registry.restart_driver(fixture.scheduler_id),
        Err(DriverError::StopRefused { driver: "cpuScheduler" })
    );
    assert_eq!(
        fixture.registry.state(fixture.scheduler_id),
        Some(LifecycleState::Active)
    );
}

#[test]
fn test_losing_the_timer_fails_the_scheduler() {
    let fixture = weighted();
    fixture.adopt_boot();
    fixture.spawn(100);

    fixture.registry.stop_driver(fixture.timer_id).unwrap();
    assert_eq!(
        fixture.registry.state(fixture.scheduler_id),
        Some(LifecycleState::Failed)
    );
    assert_eq!(fixture.scheduler.now(), Err(SchedulerError::NotStarted));

    // Without a timer the scheduler no longer switches.
    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.switch_count(), 0);
}

#[test]
fn test_scheduler_needs_a_timer() {
    let registry = keel_drivers::Registry::new();
    let scheduler = Arc::new(CpuScheduler::new(WeightedRoundRobin::default(), common::pool(2)));
    let id = registry.install(scheduler);

    assert!(matches!(
        registry.start_driver(id),
        Err(DriverError::StartFailed { driver: "cpuScheduler", .. })
    ));
    assert!(registry.find_active::<dyn Scheduler>().is_none());
}

#[test]
fn test_fixed_interval_scheduler() {
    let fixture = Fixture::start(FixedInterval::default());
    assert_eq!(fixture.timer.armed(), 60_000);
    assert_eq!(fixture.registry.name(fixture.scheduler_id), "simpleScheduler");

    fixture.adopt_boot();
    fixture.spawn(1);
    fixture.spawn(1_000);

    fixture.scheduler.yield_now();
    assert_eq!(fixture.timer.armed(), 15_000);
    fixture.scheduler.yield_now();
    assert_eq!(fixture.timer.armed(), 15_000);

    fixture.scheduler.policy().push_resolution_requirement(5_000);
    fixture.scheduler.yield_now();
    assert_eq!(fixture.timer.armed(), 5_000);
    assert!(fixture.scheduler.policy().pop_resolution_requirement(5_000));
}

static EXITED_THREAD_RAN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counted_entry() {
    EXITED_THREAD_RAN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_returning_from_entry_exits_the_thread() {
    let fixture = weighted();
    let boot = fixture.adopt_boot();
    let thread = fixture
        .kernel
        .create_kernel_thread(fixture.pages.as_ref(), counted_entry)
        .unwrap();
    let worker = fixture.scheduler.add_thread(thread);

    fixture.scheduler.yield_now();
    assert_eq!(fixture.scheduler.current_thread(), Some(worker));

    let sp = fixture
        .scheduler
        .with_thread(worker, |thread| thread.context().stack_pointer())
        .unwrap();
    unsafe { arch::run_primed(sp) };

    assert_eq!(EXITED_THREAD_RAN.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.scheduler.thread_state(worker), Some(ThreadState::Terminated));
    assert_eq!(fixture.scheduler.current_thread(), Some(boot));
    assert_eq!(fixture.scheduler.reap_terminated(), 1);
}
