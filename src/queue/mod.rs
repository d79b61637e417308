//! Execution queues: accept work units and run them under a policy.
//!
//! Each queue owns a tokio runtime whose worker threads are named after
//! the queue, plus a dispatcher task that decides which submitted unit
//! starts next. Two shared queues live for the whole process (see
//! [`shared`]); every other queue belongs to whoever built it and shuts
//! its runtime down when the last handle is dropped.

mod dispatch;
pub mod shared;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{QueuePolicy, WorkId};
use crate::telemetry::metrics;
use crate::unit::WorkUnit;

/// State shared between queue handles, the dispatcher and running units.
pub(crate) struct QueueShared {
    pub(crate) name: String,
    pub(crate) policy: QueuePolicy,
    pub(crate) shared: bool,
    /// Accepted, not yet started, in submission order.
    pub(crate) pending: Mutex<VecDeque<WorkUnit>>,
    /// Started, not yet finished.
    pub(crate) active: Mutex<Vec<WorkUnit>>,
    pub(crate) suspended: AtomicBool,
    /// Wakes the dispatcher: submission, finish, resume, cancellation.
    pub(crate) wake: Notify,
    /// Units accepted and not yet terminal.
    pub(crate) outstanding: watch::Sender<usize>,
}

impl QueueShared {
    pub(crate) fn unit_settled(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        self.wake.notify_one();
    }
}

struct QueueCore {
    shared: Arc<QueueShared>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Drop for QueueCore {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(queue = %self.shared.name, "shutting down queue runtime");
            // Safe from async contexts, unlike a plain drop.
            runtime.shutdown_background();
        }
    }
}

/// A named queue that runs work units serially or concurrently.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    core: Arc<QueueCore>,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("name", &self.name())
            .field("policy", &self.policy())
            .field("shared", &self.is_shared())
            .field("outstanding", &self.operation_count())
            .finish()
    }
}

impl ExecutionQueue {
    /// A queue that runs one unit at a time.
    pub fn serial(name: impl Into<String>) -> Result<Self> {
        Self::build(name.into(), QueuePolicy::Serial, false)
    }

    /// A queue that runs units in parallel, up to `max_concurrent` if given.
    pub fn concurrent(name: impl Into<String>, max_concurrent: Option<usize>) -> Result<Self> {
        Self::build(
            name.into(),
            QueuePolicy::Concurrent { max_concurrent },
            false,
        )
    }

    /// A bound of zero is treated as one.
    pub(crate) fn build(name: String, policy: QueuePolicy, shared: bool) -> Result<Self> {
        let workers = worker_threads(policy);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(format!("{name}-worker"))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let (outstanding, _) = watch::channel(0);
        let state = Arc::new(QueueShared {
            name,
            policy,
            shared,
            pending: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
            wake: Notify::new(),
            outstanding,
        });

        handle.spawn(dispatch::run(Arc::clone(&state)));

        info!(queue = %state.name, %policy, shared, workers, "execution queue created");
        metrics::queues_created().add(
            1,
            &[
                KeyValue::new("policy", policy.to_string()),
                KeyValue::new("shared", shared.to_string()),
            ],
        );

        Ok(Self {
            core: Arc::new(QueueCore {
                shared: state,
                handle,
                runtime: Some(runtime),
            }),
        })
    }

    fn shared(&self) -> &Arc<QueueShared> {
        &self.core.shared
    }

    /// Diagnostic label. Not unique.
    pub fn name(&self) -> &str {
        &self.shared().name
    }

    pub fn policy(&self) -> QueuePolicy {
        self.shared().policy
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.policy().max_concurrent()
    }

    /// Is this one of the process-wide shared queues?
    pub fn is_shared(&self) -> bool {
        self.shared().shared
    }

    pub fn is_suspended(&self) -> bool {
        self.shared().suspended.load(Ordering::SeqCst)
    }

    /// Units accepted by this queue that have not reached a terminal state.
    pub fn operation_count(&self) -> usize {
        *self.shared().outstanding.borrow()
    }

    /// Do both handles refer to the same queue?
    pub fn same_queue(&self, other: &ExecutionQueue) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Accept a unit for execution.
    ///
    /// A unit can be submitted once; a second submission, to this or any
    /// other queue, fails with [`Error::AlreadySubmitted`].
    pub fn submit(&self, unit: &WorkUnit) -> Result<()> {
        unit.mark_ready()?;
        let shared = self.shared();
        shared.outstanding.send_modify(|n| *n += 1);
        shared.pending.lock().push_back(unit.clone());

        debug!(
            queue = %shared.name,
            id = %unit.id(),
            name = %unit.name(),
            dependencies = unit.dependencies().len(),
            "work unit submitted"
        );
        metrics::units_submitted().add(
            1,
            &[
                KeyValue::new("queue", shared.name.clone()),
                KeyValue::new("policy", shared.policy.to_string()),
            ],
        );

        // Re-run dispatch when the unit becomes startable or is cancelled.
        let watcher = Arc::clone(shared);
        let watched = unit.clone();
        self.core.handle.spawn(async move {
            tokio::select! {
                _ = watched.dependencies_finished() => {}
                _ = watched.token().cancelled() => {}
            }
            watcher.wake.notify_one();
        });

        shared.wake.notify_one();
        Ok(())
    }

    /// Stop starting new units. Running units are unaffected.
    pub fn suspend(&self) -> Result<()> {
        self.ensure_owned()?;
        self.shared().suspended.store(true, Ordering::SeqCst);
        debug!(queue = %self.name(), "queue suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.ensure_owned()?;
        self.shared().suspended.store(false, Ordering::SeqCst);
        debug!(queue = %self.name(), "queue resumed");
        self.shared().wake.notify_one();
        Ok(())
    }

    /// Request cancellation of every pending and running unit.
    ///
    /// Returns the number of units whose flag this call set.
    pub fn cancel_all(&self) -> Result<usize> {
        self.ensure_owned()?;
        let shared = self.shared();
        let units: Vec<WorkUnit> = {
            let pending = shared.pending.lock();
            let active = shared.active.lock();
            pending.iter().chain(active.iter()).cloned().collect()
        };
        let cancelled = units.iter().filter(|unit| unit.cancel()).count();
        info!(queue = %shared.name, cancelled, "cancel_all");
        shared.wake.notify_one();
        Ok(cancelled)
    }

    /// IDs of units accepted and not yet started.
    pub fn pending_ids(&self) -> Vec<WorkId> {
        self.shared().pending.lock().iter().map(WorkUnit::id).collect()
    }

    /// Wait until every accepted unit has reached a terminal state.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared().outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn ensure_owned(&self) -> Result<()> {
        if self.is_shared() {
            Err(Error::SharedQueue(self.name().to_string()))
        } else {
            Ok(())
        }
    }
}

/// Runtime worker count. At least two so a unit that blocks its thread
/// cannot starve the dispatcher.
fn worker_threads(policy: QueuePolicy) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    match policy.max_concurrent() {
        Some(n) => n.min(available).max(2),
        None => available.max(2),
    }
}
