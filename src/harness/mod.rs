//! Test harness for work units.
//!
//! Implement [`AsyncUnitTestHarness`] for a type that knows how to build
//! the unit under test, then in each test:
//!
//! ```no_run
//! use workq_harness::harness::AsyncUnitTestHarness;
//! use workq_harness::unit::WorkUnit;
//!
//! struct Upload;
//!
//! impl AsyncUnitTestHarness for Upload {
//!     fn work_unit_under_test(&self) -> WorkUnit {
//!         WorkUnit::from_fn("upload", |cx| async move {
//!             cx.checkpoint()?;
//!             Ok(Some(serde_json::json!({"bytes": 512})))
//!         })
//!     }
//! }
//!
//! # fn main() -> workq_harness::Result<()> {
//! let fixture = Upload.fixture()?;
//! let outcome = fixture.run_on(Upload::shared_serial_queue()?)?;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```
//!
//! Fixtures block the calling thread, so use them from plain `#[test]`
//! functions, not from inside an async runtime.

pub mod conformance;

use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{Error, Result};
use crate::model::{Outcome, State};
use crate::queue::{ExecutionQueue, shared};
use crate::signal::Signal;
use crate::telemetry::{self, metrics};
use crate::unit::WorkUnit;

/// Contract for a test case exercising one kind of work unit.
pub trait AsyncUnitTestHarness {
    /// A freshly built unit configured with test values.
    ///
    /// Called once per fixture. Must not do anything beyond construction.
    fn work_unit_under_test(&self) -> WorkUnit;

    /// How long a fixture waits for a unit. Override for slow units.
    fn default_timeout(&self) -> Duration {
        config::global().default_timeout
    }

    /// The process-wide serial queue.
    fn shared_serial_queue() -> Result<&'static ExecutionQueue>
    where
        Self: Sized,
    {
        shared::serial()
    }

    /// The process-wide concurrent queue.
    fn shared_concurrent_queue() -> Result<&'static ExecutionQueue>
    where
        Self: Sized,
    {
        shared::concurrent()
    }

    /// A fresh serial queue labelled `name`, owned by the caller.
    fn serial_queue_with_name(name: &str) -> Result<ExecutionQueue>
    where
        Self: Sized,
    {
        ExecutionQueue::serial(name)
    }

    /// A fresh concurrent queue labelled `name`, owned by the caller.
    fn concurrent_queue_with_name(name: &str) -> Result<ExecutionQueue>
    where
        Self: Sized,
    {
        ExecutionQueue::concurrent(name, None)
    }

    /// Per-test state around a new unit under test.
    fn fixture(&self) -> Result<Fixture> {
        Fixture::new(self.work_unit_under_test(), self.default_timeout())
    }
}

// ---------------------------------------------------------------------------
// Expectation
// ---------------------------------------------------------------------------

/// A described, single-fire condition a test waits on.
#[derive(Debug, Clone)]
pub struct Expectation {
    description: String,
    signal: Signal,
}

impl Expectation {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            signal: Signal::new(),
        }
    }

    /// Mark the expectation met. Later calls are no-ops.
    pub fn fulfill(&self) {
        self.signal.fire();
    }

    pub fn is_fulfilled(&self) -> bool {
        self.signal.is_fired()
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// Per-test state: the unit under test, the timeout, owned queues.
///
/// Dropping the fixture tears it down: the unit is cancelled if it has not
/// finished, and each owned queue is drained, or cancelled if it does not
/// drain within the teardown grace period.
pub struct Fixture {
    unit: WorkUnit,
    timeout: Duration,
    teardown_grace: Duration,
    queues: Vec<ExecutionQueue>,
    runtime: Runtime,
}

impl Fixture {
    pub fn new(unit: WorkUnit, timeout: Duration) -> Result<Self> {
        telemetry::init_test_logging();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        debug!(id = %unit.id(), name = %unit.name(), ?timeout, "fixture set up");
        Ok(Self {
            unit,
            timeout,
            teardown_grace: config::global().teardown_grace,
            queues: Vec::new(),
            runtime,
        })
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A serial queue owned by this fixture.
    pub fn serial_queue(&mut self, name: &str) -> Result<ExecutionQueue> {
        let queue = ExecutionQueue::serial(name)?;
        self.queues.push(queue.clone());
        Ok(queue)
    }

    /// A concurrent queue owned by this fixture.
    pub fn concurrent_queue(&mut self, name: &str) -> Result<ExecutionQueue> {
        let queue = ExecutionQueue::concurrent(name, None)?;
        self.queues.push(queue.clone());
        Ok(queue)
    }

    /// Take ownership of a queue built elsewhere so teardown drains it.
    pub fn adopt(&mut self, queue: &ExecutionQueue) -> Result<()> {
        if queue.is_shared() {
            return Err(Error::SharedQueue(queue.name().to_string()));
        }
        self.queues.push(queue.clone());
        Ok(())
    }

    /// Submit the unit under test.
    pub fn submit(&self, queue: &ExecutionQueue) -> Result<()> {
        queue.submit(&self.unit)
    }

    /// Block until the unit under test is terminal or the timeout elapses.
    pub fn wait(&self) -> Result<State> {
        self.wait_for(&self.unit)
    }

    /// Block until `unit` is terminal or the timeout elapses.
    ///
    /// On timeout the unit is cancelled (best effort) and
    /// [`Error::Timeout`] is returned.
    pub fn wait_for(&self, unit: &WorkUnit) -> Result<State> {
        // Completion and the deadline race inside one future; exactly one wins.
        let waited = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, unit.finished()).await });

        match waited {
            Ok(state) => Ok(state),
            Err(_) => {
                let last_state = unit.state();
                warn!(
                    id = %unit.id(),
                    name = %unit.name(),
                    %last_state,
                    timeout = ?self.timeout,
                    "work unit timed out"
                );
                metrics::harness_timeouts().add(1, &[KeyValue::new("kind", "unit")]);
                // No-op if the unit finished right at the deadline.
                unit.cancel();
                Err(Error::Timeout {
                    id: unit.id(),
                    last_state,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Wait, then require the unit under test to have finished in `expected`.
    pub fn expect_state(&self, expected: State) -> Result<Outcome> {
        expect_state_of(&self.unit, self.wait()?, expected)
    }

    pub fn expect_completed(&self) -> Result<Outcome> {
        self.expect_state(State::Completed)
    }

    pub fn expect_cancelled(&self) -> Result<Outcome> {
        self.expect_state(State::Cancelled)
    }

    pub fn expect_failed(&self) -> Result<Outcome> {
        self.expect_state(State::Failed)
    }

    /// Submit to `queue`, wait, and require completion.
    pub fn run_on(&self, queue: &ExecutionQueue) -> Result<Outcome> {
        self.submit(queue)?;
        self.expect_completed()
    }

    pub fn expectation(&self, description: impl Into<String>) -> Expectation {
        Expectation::new(description)
    }

    /// Block until `expectation` is fulfilled or the timeout elapses.
    pub fn wait_for_expectation(&self, expectation: &Expectation) -> Result<()> {
        let waited = self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, expectation.signal.fired()).await
        });
        waited.map_err(|_| {
            warn!(description = %expectation.description, timeout = ?self.timeout, "expectation timed out");
            metrics::harness_timeouts().add(1, &[KeyValue::new("kind", "expectation")]);
            Error::ExpectationTimeout {
                description: expectation.description.clone(),
                timeout: self.timeout,
            }
        })
    }

    fn teardown_queue(&self, queue: &ExecutionQueue) {
        let grace = self.teardown_grace;
        let drained = self
            .runtime
            .block_on(async { tokio::time::timeout(grace, queue.wait_until_idle()).await })
            .is_ok();
        if drained {
            return;
        }

        warn!(
            queue = %queue.name(),
            outstanding = queue.operation_count(),
            "queue not drained at teardown, cancelling remaining units"
        );
        let _ = queue.resume();
        let _ = queue.cancel_all();
        let drained = self
            .runtime
            .block_on(async { tokio::time::timeout(grace, queue.wait_until_idle()).await })
            .is_ok();
        if !drained {
            warn!(
                queue = %queue.name(),
                outstanding = queue.operation_count(),
                "queue still busy after cancel_all, abandoning it"
            );
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if !self.unit.is_finished() {
            self.unit.cancel();
        }
        for queue in std::mem::take(&mut self.queues) {
            self.teardown_queue(&queue);
        }
        info!(id = %self.unit.id(), state = %self.unit.state(), "fixture torn down");
    }
}

/// Map a terminal state onto the harness error taxonomy.
pub fn expect_state_of(unit: &WorkUnit, actual: State, expected: State) -> Result<Outcome> {
    if actual == expected {
        return Ok(unit.outcome().unwrap_or_else(|| Outcome::cancelled(0)));
    }
    if actual == State::Failed {
        let error = unit
            .outcome()
            .and_then(|o| o.error)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(Error::WorkUnitFailed {
            id: unit.id(),
            error,
        });
    }
    Err(Error::UnexpectedState {
        id: unit.id(),
        expected,
        actual,
    })
}
