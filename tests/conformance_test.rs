//! Runs the conformance checks against a few kinds of work unit.

use std::time::Duration;

use serde_json::json;
use workq_harness::harness::AsyncUnitTestHarness;
use workq_harness::unit::{Job, JobContext, JobResult, WorkUnit};

/// Completes immediately.
pub struct EchoHarness;

impl AsyncUnitTestHarness for EchoHarness {
    fn work_unit_under_test(&self) -> WorkUnit {
        WorkUnit::from_fn("echo", |cx| async move {
            Ok(Some(json!({"echo": cx.name()})))
        })
    }
}

/// A hand-written job that works in steps and checks for cancellation
/// between them.
struct Checksum {
    chunks: Vec<Vec<u8>>,
}

#[async_trait::async_trait]
impl Job for Checksum {
    async fn run(&self, cx: JobContext) -> JobResult {
        let mut sum: u64 = 0;
        for chunk in &self.chunks {
            cx.checkpoint()?;
            sum = chunk.iter().fold(sum, |acc, b| acc.wrapping_add(u64::from(*b)));
            cx.sleep(Duration::from_millis(5)).await?;
        }
        Ok(Some(json!({ "sum": sum })))
    }
}

pub struct ChecksumHarness;

impl AsyncUnitTestHarness for ChecksumHarness {
    fn work_unit_under_test(&self) -> WorkUnit {
        WorkUnit::new(
            "checksum",
            Checksum {
                chunks: vec![vec![1, 2, 3], vec![4, 5], vec![6]],
            },
        )
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

mod echo {
    workq_harness::work_unit_conformance_tests!(super::EchoHarness);
}

mod checksum {
    workq_harness::work_unit_conformance_tests!(super::ChecksumHarness);
}

#[test]
fn checksum_job_produces_sum() {
    let fixture = ChecksumHarness.fixture().unwrap();
    let outcome = fixture
        .run_on(ChecksumHarness::shared_concurrent_queue().unwrap())
        .unwrap();
    assert_eq!(outcome.data, Some(json!({"sum": 21})));
}
