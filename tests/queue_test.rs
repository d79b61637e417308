//! Integration tests for execution queues.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use workq_harness::Error;
use workq_harness::model::{QueuePolicy, State};
use workq_harness::queue::{ExecutionQueue, shared};
use workq_harness::signal::Signal;
use workq_harness::unit::{JobError, WorkUnit};

const WAIT: Duration = Duration::from_secs(5);

async fn finish(unit: &WorkUnit) -> State {
    tokio::time::timeout(WAIT, unit.finished())
        .await
        .unwrap_or_else(|_| panic!("{} did not finish (state: {})", unit.name(), unit.state()))
}

fn sleeper(name: &str, millis: u64) -> WorkUnit {
    WorkUnit::from_fn(name, move |cx| async move {
        cx.sleep(Duration::from_millis(millis)).await?;
        Ok(None)
    })
}

/// Fires `mine`, then needs `theirs` to fire. Only finishes if both units
/// run at the same time.
fn rendezvous(name: &str, mine: Signal, theirs: Signal) -> WorkUnit {
    WorkUnit::from_fn(name, move |_cx| {
        let mine = mine.clone();
        let theirs = theirs.clone();
        async move {
            mine.fire();
            tokio::time::timeout(Duration::from_secs(2), theirs.fired())
                .await
                .map_err(|_| JobError::failed("peer never started"))?;
            Ok(None)
        }
    })
}

fn assert_ran_in_order(units: &[WorkUnit]) {
    for pair in units.windows(2) {
        let done = pair[0].seq_of(State::Completed).unwrap();
        let next_started = pair[1].seq_of(State::Executing).unwrap();
        assert!(
            done < next_started,
            "{} started before {} finished",
            pair[1].name(),
            pair[0].name()
        );
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn serial_queue_runs_in_submission_order_without_overlap() {
    let queue = ExecutionQueue::serial("ordering").unwrap();
    let units: Vec<_> = (0..5).map(|i| sleeper(&format!("unit-{i}"), 10)).collect();

    for unit in &units {
        queue.submit(unit).unwrap();
    }
    for unit in &units {
        assert_eq!(finish(unit).await, State::Completed);
    }

    assert_ran_in_order(&units);
}

#[tokio::test]
async fn serial_queue_skips_units_waiting_on_dependencies() {
    let queue = ExecutionQueue::serial("dependencies").unwrap();
    let blocked = sleeper("blocked", 1);
    let dependency = sleeper("dependency", 1);
    blocked.add_dependency(&dependency).unwrap();

    queue.submit(&blocked).unwrap();
    queue.submit(&dependency).unwrap();

    assert_eq!(finish(&blocked).await, State::Completed);
    assert!(dependency.seq_of(State::Completed) < blocked.seq_of(State::Executing));
}

#[tokio::test]
async fn concurrent_queue_runs_units_in_parallel() {
    let queue = ExecutionQueue::concurrent("parallel", None).unwrap();
    let (a, b) = (Signal::new(), Signal::new());
    let first = rendezvous("first", a.clone(), b.clone());
    let second = rendezvous("second", b, a);

    queue.submit(&first).unwrap();
    queue.submit(&second).unwrap();

    // Either order is fine; both must complete.
    assert_eq!(finish(&second).await, State::Completed);
    assert_eq!(finish(&first).await, State::Completed);
}

#[tokio::test]
async fn bounded_concurrent_queue_respects_limit() {
    let queue = ExecutionQueue::concurrent("bounded", Some(2)).unwrap();
    let running = Arc::new(Mutex::new((0usize, 0usize)));

    let units: Vec<_> = (0..6)
        .map(|i| {
            let running = Arc::clone(&running);
            WorkUnit::from_fn(format!("bounded-{i}"), move |_cx| {
                let running = Arc::clone(&running);
                async move {
                    {
                        let mut r = running.lock();
                        r.0 += 1;
                        r.1 = r.1.max(r.0);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.lock().0 -= 1;
                    Ok(None)
                }
            })
        })
        .collect();

    for unit in &units {
        queue.submit(unit).unwrap();
    }
    for unit in &units {
        finish(unit).await;
    }

    let peak = running.lock().1;
    assert!(peak <= 2, "peak concurrency {peak}");
    assert_eq!(queue.max_concurrent(), Some(2));
}

// Scenario D
#[tokio::test]
async fn separate_serial_queues_run_alongside_each_other() {
    let left = ExecutionQueue::serial("left").unwrap();
    let right = ExecutionQueue::serial("right").unwrap();
    let (l, r) = (Signal::new(), Signal::new());

    let left_units = vec![
        rendezvous("left-0", l.clone(), r.clone()),
        sleeper("left-1", 5),
    ];
    let right_units = vec![rendezvous("right-0", r, l), sleeper("right-1", 5)];

    for unit in &left_units {
        left.submit(unit).unwrap();
    }
    for unit in &right_units {
        right.submit(unit).unwrap();
    }
    for unit in left_units.iter().chain(&right_units) {
        assert_eq!(finish(unit).await, State::Completed, "{}", unit.name());
    }

    assert_ran_in_order(&left_units);
    assert_ran_in_order(&right_units);
}

// ---------------------------------------------------------------------------
// Submission and control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unit_cannot_be_submitted_twice() {
    let first = ExecutionQueue::serial("first").unwrap();
    let second = ExecutionQueue::concurrent("second", None).unwrap();
    let unit = sleeper("once", 1);

    first.submit(&unit).unwrap();
    let err = second.submit(&unit).unwrap_err();
    assert!(matches!(err, Error::AlreadySubmitted { .. }));
    assert_eq!(finish(&unit).await, State::Completed);
}

#[tokio::test]
async fn suspended_queue_holds_units_until_resumed() {
    let queue = ExecutionQueue::concurrent("suspended", None).unwrap();
    queue.suspend().unwrap();
    assert!(queue.is_suspended());

    let unit = sleeper("held", 1);
    queue.submit(&unit).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(unit.state(), State::Ready);
    assert_eq!(queue.pending_ids(), vec![unit.id()]);

    queue.resume().unwrap();
    assert_eq!(finish(&unit).await, State::Completed);
}

#[tokio::test]
async fn cancel_all_reaches_running_units() {
    let queue = ExecutionQueue::serial("cancel-running").unwrap();
    let running = sleeper("running", 10_000);
    let waiting = sleeper("waiting", 10_000);
    queue.submit(&running).unwrap();
    queue.submit(&waiting).unwrap();

    while running.state() != State::Executing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(queue.cancel_all().unwrap(), 2);

    assert_eq!(finish(&running).await, State::Cancelled);
    assert_eq!(finish(&waiting).await, State::Cancelled);
    // One observed cancellation mid-run, the other never started.
    assert!(running.seq_of(State::Executing).is_some());
    assert!(waiting.seq_of(State::Executing).is_none());
}

#[tokio::test]
async fn completion_handler_runs_for_cancelled_unit() {
    let queue = ExecutionQueue::serial("handler-on-cancel").unwrap();
    let seen = Arc::new(Mutex::new(None));
    let unit = sleeper("cancelled", 1);
    let record = Arc::clone(&seen);
    unit.set_completion_handler(move |unit| *record.lock() = Some(unit.state()));

    queue.suspend().unwrap();
    queue.submit(&unit).unwrap();
    unit.cancel();
    queue.resume().unwrap();

    finish(&unit).await;
    queue.wait_until_idle().await;
    assert_eq!(*seen.lock(), Some(State::Cancelled));
}

#[tokio::test]
async fn wait_until_idle_returns_after_all_units_settle() {
    let queue = ExecutionQueue::concurrent("idle", Some(3)).unwrap();
    let units: Vec<_> = (0..4).map(|i| sleeper(&format!("idle-{i}"), 10)).collect();
    for unit in &units {
        queue.submit(unit).unwrap();
    }

    tokio::time::timeout(WAIT, queue.wait_until_idle())
        .await
        .expect("queue never went idle");
    assert_eq!(queue.operation_count(), 0);
    assert!(units.iter().all(WorkUnit::is_finished));
}

#[tokio::test]
async fn panicking_completion_handler_does_not_stall_queue() {
    let queue = ExecutionQueue::serial("handler-panic").unwrap();
    let first = sleeper("first", 1);
    first.set_completion_handler(|_| panic!("handler blew up"));
    let second = sleeper("second", 1);

    queue.submit(&first).unwrap();
    queue.submit(&second).unwrap();

    assert_eq!(finish(&first).await, State::Completed);
    assert_eq!(finish(&second).await, State::Completed);
    tokio::time::timeout(WAIT, queue.wait_until_idle())
        .await
        .expect("queue stalled after handler panic");
    assert_eq!(queue.operation_count(), 0);
}

// ---------------------------------------------------------------------------
// Shared queues
// ---------------------------------------------------------------------------

#[test]
fn shared_queues_are_singletons() {
    let serial = shared::serial().unwrap();
    assert!(serial.same_queue(shared::serial().unwrap()));
    assert_eq!(serial.policy(), QueuePolicy::Serial);
    assert_eq!(serial.name(), shared::SHARED_SERIAL_NAME);

    let concurrent = shared::concurrent().unwrap();
    assert!(concurrent.same_queue(shared::concurrent().unwrap()));
    assert!(!concurrent.same_queue(serial));
    assert!(!concurrent.policy().is_serial());
}

#[test]
fn shared_queues_refuse_reconfiguration() {
    let serial = shared::serial().unwrap();
    assert!(matches!(serial.suspend(), Err(Error::SharedQueue(_))));
    assert!(matches!(serial.resume(), Err(Error::SharedQueue(_))));
    assert!(matches!(serial.cancel_all(), Err(Error::SharedQueue(_))));
    assert!(!serial.is_suspended());
}

#[test]
fn named_queues_are_independent() {
    let a = ExecutionQueue::serial("same-name").unwrap();
    let b = ExecutionQueue::serial("same-name").unwrap();
    assert_eq!(a.name(), b.name());
    assert!(!a.same_queue(&b));
    assert!(a.same_queue(&a.clone()));
}
