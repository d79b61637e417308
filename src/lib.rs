//! # workq-harness
//!
//! Test harness for asynchronous, cancellable work units.
//!
//! A work unit wraps a [`unit::Job`] and moves through a fixed lifecycle
//! while an [`queue::ExecutionQueue`] runs it under a serial or concurrent
//! policy. Test cases implement [`harness::AsyncUnitTestHarness`] for their
//! work unit type and drive it through a [`harness::Fixture`], which blocks
//! the test thread until the unit finishes or a timeout elapses.

pub mod config;
pub mod error;
pub mod harness;
pub mod model;
pub mod queue;
pub mod signal;
pub mod telemetry;
pub mod unit;

pub use error::{Error, Result};
