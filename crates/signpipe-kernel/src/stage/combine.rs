//! Terminal aggregator: sorts every digest and joins them with `_`.

use std::sync::Arc;

use async_trait::async_trait;

use signpipe_types::{BatchReport, ItemFailure, ItemResult, StageState};

use super::{Stage, StageError, StageMeter};
use crate::queue::{QueueReader, QueueWriter};

/// Separator between digests in the joined result.
pub const JOIN_SEPARATOR: &str = "_";

/// Collects the whole stream and emits exactly one `BatchReport`.
#[derive(Debug, Clone, Default)]
pub struct CombineResults {
    capacity_hint: usize,
}

impl CombineResults {
    pub const NAME: &'static str = "combine_results";

    /// `capacity_hint` pre-sizes the accumulator; it is not a limit.
    pub fn new(capacity_hint: usize) -> Self {
        Self { capacity_hint }
    }
}

/// Sort the successes byte-wise and join them. Failures are ordered by input
/// and then by stage so the report does not depend on arrival order.
pub fn combine(mut successes: Vec<String>, mut failures: Vec<ItemFailure>) -> BatchReport {
    successes.sort_unstable();
    failures.sort_by(|a, b| a.input.cmp(&b.input).then_with(|| a.stage.cmp(&b.stage)));
    BatchReport {
        joined: successes.join(JOIN_SEPARATOR),
        succeeded: successes.len(),
        failures,
    }
}

#[async_trait]
impl Stage for CombineResults {
    type Input = ItemResult<String>;
    type Output = BatchReport;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        mut input: QueueReader<ItemResult<String>>,
        output: QueueWriter<BatchReport>,
        meter: Arc<StageMeter>,
    ) -> Result<(), StageError> {
        let mut successes = Vec::with_capacity(self.capacity_hint);
        let mut failures = Vec::new();

        while let Some(item) = input.recv().await {
            meter.record_in();
            match item {
                Ok(hash) => successes.push(hash),
                Err(failure) => {
                    meter.record_failure();
                    failures.push(failure);
                }
            }
        }

        meter.set_state(StageState::Draining);
        let report = combine(successes, failures);
        tracing::debug!(
            succeeded = report.succeeded,
            failed = report.failures.len(),
            "combined"
        );
        tracing::trace!(joined = %report.joined, "combine results");

        output.send(report).await?;
        meter.record_out();
        Ok(())
    }
}
