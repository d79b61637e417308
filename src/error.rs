//! Error types for workq-harness.

use std::time::Duration;

use thiserror::Error;

use crate::model::{State, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    /// The unit did not reach a terminal state in time.
    #[error("work unit {id} did not finish within {timeout:?} (last state: {last_state})")]
    Timeout {
        id: WorkId,
        last_state: State,
        timeout: Duration,
    },

    /// The unit itself reported failure.
    #[error("work unit {id} failed: {error} (last state: failed)")]
    WorkUnitFailed { id: WorkId, error: String },

    /// The unit finished, but not in the state the test asserted.
    #[error("work unit {id} finished {actual}, expected {expected} (last state: {actual})")]
    UnexpectedState {
        id: WorkId,
        expected: State,
        actual: State,
    },

    #[error("expectation not fulfilled within {timeout:?}: {description}")]
    ExpectationTimeout {
        description: String,
        timeout: Duration,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("work unit {id} was already submitted (state: {state})")]
    AlreadySubmitted { id: WorkId, state: State },

    #[error("queue {0} is shared and cannot be reconfigured")]
    SharedQueue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
