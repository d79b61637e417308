//! Dispatcher loop and unit execution.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use super::QueueShared;
use crate::model::State;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_unit_span};
use crate::unit::{JobError, WorkUnit};

/// Run until the queue's runtime shuts down.
pub(super) async fn run(shared: Arc<QueueShared>) {
    loop {
        // A notify_one with no waiter is stored, so wakes are never lost.
        shared.wake.notified().await;
        dispatch(&shared);
    }
}

/// Start every unit that may start now, and settle cancelled ones.
fn dispatch(shared: &Arc<QueueShared>) {
    if shared.suspended.load(Ordering::SeqCst) {
        return;
    }

    let limit = shared.policy.max_concurrent();
    let mut pending = shared.pending.lock();
    let mut index = 0;
    while index < pending.len() {
        let unit = &pending[index];

        // Cancelled units finish without running and without a slot.
        if unit.is_cancel_requested() {
            if let Some(unit) = pending.remove(index) {
                tokio::spawn(settle_cancelled(Arc::clone(shared), unit));
            }
            continue;
        }

        let full = limit.is_some_and(|max| shared.active.lock().len() >= max);
        if !full && unit.dependencies_ready() {
            if let Some(unit) = pending.remove(index) {
                shared.active.lock().push(unit.clone());
                tokio::spawn(execute(Arc::clone(shared), unit));
            }
            continue;
        }

        index += 1;
    }
}

async fn settle_cancelled(shared: Arc<QueueShared>, unit: WorkUnit) {
    match unit.finish_cancelled() {
        Ok(()) => debug!(queue = %shared.name, id = %unit.id(), "cancelled before start"),
        Err(e) => warn!(queue = %shared.name, id = %unit.id(), "cannot cancel unit: {e}"),
    }
    unit.run_completion_handler();
    shared.unit_settled();
}

async fn execute(shared: Arc<QueueShared>, unit: WorkUnit) {
    let span = start_unit_span(&shared.name, &unit.id(), unit.name());

    async {
        match unit.begin() {
            Ok(State::Executing) => record_state_transition(&span, "ready", "executing"),
            Ok(state) => {
                // Cancelled between dispatch and start; the job never runs.
                record_state_transition(&span, "ready", &state.to_string());
                debug!(id = %unit.id(), %state, "cancelled before start");
                unit.run_completion_handler();
                return;
            }
            Err(e) => {
                warn!(id = %unit.id(), "cannot start unit: {e}");
                return;
            }
        }

        let start = Instant::now();
        let job = unit.job();
        let cx = unit.context();
        // A separate task turns a panicking job into a join error.
        let result = match tokio::spawn(async move { job.run(cx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::failed(format!("job panicked: {e}"))),
            Err(e) => Err(JobError::failed(format!("job aborted: {e}"))),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match unit.finish(result, duration_ms) {
            Ok(state) => {
                record_state_transition(&span, "executing", &state.to_string());
                if state == State::Failed {
                    let error = unit
                        .outcome()
                        .and_then(|o| o.error)
                        .unwrap_or_default();
                    warn!(id = %unit.id(), %error, duration_ms, "work unit failed");
                } else {
                    debug!(id = %unit.id(), %state, duration_ms, "work unit finished");
                }
                metrics::unit_duration_ms().record(
                    duration_ms as f64,
                    &[
                        KeyValue::new("queue", shared.name.clone()),
                        KeyValue::new("state", state.to_string()),
                    ],
                );
            }
            Err(e) => warn!(id = %unit.id(), "cannot finish unit: {e}"),
        }

        unit.run_completion_handler();
    }
    .instrument(span.clone())
    .await;

    shared.active.lock().retain(|u| u.id() != unit.id());
    shared.unit_settled();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::queue::ExecutionQueue;

    #[tokio::test]
    async fn cancel_after_dispatch_skips_the_job() {
        let queue = ExecutionQueue::serial("late-cancel").unwrap();
        queue.suspend().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let unit = WorkUnit::from_fn("late-cancel", move |_cx| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(None)
            }
        });
        let handled = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&handled);
        unit.set_completion_handler(move |_| seen.store(true, Ordering::SeqCst));

        // The dispatcher has already picked the unit when cancel lands.
        unit.mark_ready().unwrap();
        let shared = Arc::clone(queue.shared());
        shared.outstanding.send_modify(|n| *n += 1);
        shared.active.lock().push(unit.clone());
        assert!(unit.cancel());

        execute(Arc::clone(&shared), unit.clone()).await;

        assert_eq!(unit.state(), State::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(handled.load(Ordering::SeqCst));
        let path: Vec<State> = unit.transitions().iter().map(|t| t.to).collect();
        assert_eq!(path, vec![State::Ready, State::Cancelled]);
        assert!(shared.active.lock().is_empty());
        assert_eq!(queue.operation_count(), 0);
    }
}
