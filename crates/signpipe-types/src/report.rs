//! Reports produced by a pipeline run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outcome::ItemFailure;

/// The aggregator's single output: the joined digests plus whatever failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Successful digests, sorted byte-wise and joined with `_`.
    pub joined: String,
    /// Number of items that contributed to `joined`.
    pub succeeded: usize,
    /// Items that could not be signed, ordered by input.
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    /// Total number of items the aggregator saw.
    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    /// True when every item was signed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lifecycle of one stage within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Created, task not started yet.
    Idle,
    /// Consuming its input queue.
    Running,
    /// Input closed; finishing buffered and in-flight work.
    Draining,
    /// Output queue closed after a clean finish.
    Closed,
    /// The stage task returned an error or panicked.
    Failed,
}

impl StageState {
    /// Whether the stage can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Closed | StageState::Failed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Idle => write!(f, "Idle"),
            StageState::Running => write!(f, "Running"),
            StageState::Draining => write!(f, "Draining"),
            StageState::Closed => write!(f, "Closed"),
            StageState::Failed => write!(f, "Failed"),
        }
    }
}

/// Counters for one stage after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Items read from the input queue.
    pub items_in: u64,
    /// Items written to the output queue.
    pub items_out: u64,
    /// Items that left this stage as failures.
    pub failed: u64,
    /// Wall time from launch to output close.
    pub elapsed: Duration,
    /// Final state.
    pub state: StageState,
}

/// Per-stage reports for one run, in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    /// The run is done once every stage has closed its output.
    pub fn is_done(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(|s| s.state == StageState::Closed)
    }

    /// Look up a stage report by name.
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignerError;

    fn stage(name: &str, state: StageState) -> StageReport {
        StageReport {
            name: name.to_string(),
            items_in: 1,
            items_out: 1,
            failed: 0,
            elapsed: Duration::from_millis(1),
            state,
        }
    }

    #[test]
    fn test_batch_report_counts() {
        let report = BatchReport {
            joined: "a_b".to_string(),
            succeeded: 2,
            failures: vec![ItemFailure::new("single_hash", "3", SignerError::Closed)],
        };
        assert_eq!(report.total(), 3);
        assert!(!report.is_complete());
        assert!(BatchReport::default().is_complete());
    }

    #[test]
    fn test_pipeline_done_requires_all_closed() {
        let mut report = PipelineReport {
            stages: vec![stage("a", StageState::Closed), stage("b", StageState::Closed)],
        };
        assert!(report.is_done());

        report.stages[1].state = StageState::Failed;
        assert!(!report.is_done());
        assert!(!PipelineReport::default().is_done());
    }

    #[test]
    fn test_stage_lookup() {
        let report = PipelineReport {
            stages: vec![stage("single_hash", StageState::Closed)],
        };
        assert!(report.stage("single_hash").is_some());
        assert!(report.stage("missing").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(StageState::Closed.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(!StageState::Draining.is_terminal());
        assert_eq!(StageState::Draining.to_string(), "Draining");
    }
}
