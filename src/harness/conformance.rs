//! Behaviour every work unit is expected to show on a queue.
//!
//! Each check takes a harness and returns `Ok(())` or the harness error
//! describing what went wrong. [`work_unit_conformance_tests!`] expands
//! them into `#[test]` functions:
//!
//! ```ignore
//! mod upload_conformance {
//!     workq_harness::work_unit_conformance_tests!(super::UploadHarness);
//! }
//! ```
//!
//! [`work_unit_conformance_tests!`]: crate::work_unit_conformance_tests

use super::{AsyncUnitTestHarness, Fixture};
use crate::error::{Error, Result};
use crate::model::State;
use crate::queue::ExecutionQueue;
use crate::unit::WorkUnit;

/// Which kind of owned queue a check runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Serial,
    Concurrent,
}

fn owned_queue(fixture: &mut Fixture, kind: QueueKind, name: &str) -> Result<ExecutionQueue> {
    match kind {
        QueueKind::Serial => fixture.serial_queue(name),
        QueueKind::Concurrent => fixture.concurrent_queue(name),
    }
}

/// A new unit has not been submitted or cancelled.
pub fn unit_under_test_starts_created<H: AsyncUnitTestHarness>(harness: &H) -> Result<()> {
    let unit = harness.work_unit_under_test();
    if unit.state() != State::Created {
        return Err(Error::UnexpectedState {
            id: unit.id(),
            expected: State::Created,
            actual: unit.state(),
        });
    }
    if unit.is_cancel_requested() {
        return Err(Error::Other(format!(
            "work unit {} was cancelled before submission",
            unit.id()
        )));
    }
    Ok(())
}

/// The completion handler runs once the unit finishes.
pub fn completion_handler_runs<H: AsyncUnitTestHarness>(harness: &H, kind: QueueKind) -> Result<()> {
    let mut fixture = harness.fixture()?;
    let queue = owned_queue(&mut fixture, kind, "completion_handler_runs")?;
    let expectation = fixture.expectation("completion handler ran");

    let fulfilled = expectation.clone();
    fixture
        .unit()
        .set_completion_handler(move |_| fulfilled.fulfill());

    queue.suspend()?;
    fixture.submit(&queue)?;
    queue.resume()?;

    fixture.wait_for_expectation(&expectation)
}

/// A dependency added to the unit runs first, even when submitted after it.
pub fn dependency_runs_first<H: AsyncUnitTestHarness>(harness: &H, kind: QueueKind) -> Result<()> {
    let mut fixture = harness.fixture()?;
    let queue = owned_queue(&mut fixture, kind, "dependency_runs_first")?;
    let expectation = fixture.expectation("dependency ran");

    let fulfilled = expectation.clone();
    let dependency = WorkUnit::from_fn("dependency", move |_cx| {
        let fulfilled = fulfilled.clone();
        async move {
            fulfilled.fulfill();
            Ok(None)
        }
    });
    fixture.unit().add_dependency(&dependency)?;

    queue.suspend()?;
    fixture.submit(&queue)?;
    queue.submit(&dependency)?;
    queue.resume()?;

    fixture.wait_for_expectation(&expectation)?;
    let dependency_state = fixture.wait_for(&dependency)?;

    let dependency_done = dependency.seq_of(dependency_state);
    let unit_started = fixture.unit().seq_of(State::Executing);
    match (dependency_done, unit_started) {
        (Some(done), Some(started)) if started < done => Err(Error::Other(format!(
            "work unit {} started before its dependency finished",
            fixture.unit().id()
        ))),
        _ => Ok(()),
    }
}

/// Cancelling every unit on a suspended queue leaves the unit cancelled.
pub fn cancel_all_cancels_unit<H: AsyncUnitTestHarness>(harness: &H, kind: QueueKind) -> Result<()> {
    let mut fixture = harness.fixture()?;
    let queue = owned_queue(&mut fixture, kind, "cancel_all_cancels_unit")?;

    queue.suspend()?;
    fixture.submit(&queue)?;
    queue.cancel_all()?;
    queue.resume()?;

    fixture.expect_cancelled()?;
    Ok(())
}

/// Expand the conformance checks into `#[test]` functions for a harness.
///
/// The argument is an expression evaluating to the harness value.
#[macro_export]
macro_rules! work_unit_conformance_tests {
    ($harness:expr) => {
        use $crate::harness::conformance::{self as __conformance, QueueKind as __QueueKind};

        #[test]
        fn unit_under_test_starts_created() -> $crate::Result<()> {
            __conformance::unit_under_test_starts_created(&$harness)
        }

        #[test]
        fn completion_handler_runs_on_serial_queue() -> $crate::Result<()> {
            __conformance::completion_handler_runs(&$harness, __QueueKind::Serial)
        }

        #[test]
        fn completion_handler_runs_on_concurrent_queue() -> $crate::Result<()> {
            __conformance::completion_handler_runs(&$harness, __QueueKind::Concurrent)
        }

        #[test]
        fn dependency_runs_first_on_serial_queue() -> $crate::Result<()> {
            __conformance::dependency_runs_first(&$harness, __QueueKind::Serial)
        }

        #[test]
        fn dependency_runs_first_on_concurrent_queue() -> $crate::Result<()> {
            __conformance::dependency_runs_first(&$harness, __QueueKind::Concurrent)
        }

        #[test]
        fn cancel_all_cancels_unit_on_serial_queue() -> $crate::Result<()> {
            __conformance::cancel_all_cancels_unit(&$harness, __QueueKind::Serial)
        }

        #[test]
        fn cancel_all_cancels_unit_on_concurrent_queue() -> $crate::Result<()> {
            __conformance::cancel_all_cancels_unit(&$harness, __QueueKind::Concurrent)
        }
    };
}
