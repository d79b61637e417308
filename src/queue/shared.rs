//! Process-wide shared queues.
//!
//! Built lazily on first access and never dropped. Tests may submit to
//! them but cannot suspend, resume or cancel-all them.

use std::sync::OnceLock;

use super::ExecutionQueue;
use crate::config;
use crate::error::{Error, Result};
use crate::model::QueuePolicy;

pub const SHARED_SERIAL_NAME: &str = "workq-harness.shared-serial";
pub const SHARED_CONCURRENT_NAME: &str = "workq-harness.shared-concurrent";

static SERIAL: OnceLock<std::result::Result<ExecutionQueue, String>> = OnceLock::new();
static CONCURRENT: OnceLock<std::result::Result<ExecutionQueue, String>> = OnceLock::new();

/// The shared serial queue.
pub fn serial() -> Result<&'static ExecutionQueue> {
    resolve(&SERIAL, SHARED_SERIAL_NAME, QueuePolicy::Serial)
}

/// The shared concurrent queue, bounded by `WORKQ_HARNESS_MAX_CONCURRENT`.
pub fn concurrent() -> Result<&'static ExecutionQueue> {
    resolve(
        &CONCURRENT,
        SHARED_CONCURRENT_NAME,
        QueuePolicy::Concurrent {
            max_concurrent: config::global().max_concurrent,
        },
    )
}

fn resolve(
    cell: &'static OnceLock<std::result::Result<ExecutionQueue, String>>,
    name: &str,
    policy: QueuePolicy,
) -> Result<&'static ExecutionQueue> {
    cell.get_or_init(|| {
        ExecutionQueue::build(name.to_string(), policy, true).map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| Error::Other(format!("shared queue {name} unavailable: {e}")))
}
