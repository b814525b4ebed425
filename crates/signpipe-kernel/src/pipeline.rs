//! Pipeline executor.
//!
//! A `Pipeline<In, Out>` is an ordered chain of stages whose item types line
//! up at compile time. Every run allocates fresh bounded queues between
//! adjacent stages and spawns one task per stage:
//!
//! ```text
//!   input ──▶ [stage 0] ──queue──▶ [stage 1] ──queue──▶ … ──▶ [stage n] ──▶ output
//! ```
//!
//! Each stage closes its output when it returns, so end-of-stream ripples
//! downstream. A stage that errors or panics is contained: its queues are
//! dropped with it, the stages around it see closed queues and stop, and the
//! run reports the failing stage instead of hanging.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::Instrument;

use signpipe_types::{BatchReport, PipelineReport};

use crate::queue::{QUEUE_CAPACITY, QueueReader, QueueWriter, item_queue};
use crate::stage::{Stage, StageError, StageMeter};

/// Why a run did not produce a clean result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A stage task returned an error.
    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    /// A stage task panicked.
    #[error("stage {stage} panicked: {message}")]
    StagePanicked { stage: String, message: String },

    /// The run finished but some items could not be signed.
    #[error("{} of {} items failed", .0.failures.len(), .0.total())]
    PartialFailure(Box<BatchReport>),

    /// The last stage closed its output without emitting anything.
    #[error("pipeline produced no output")]
    NoOutput,
}

impl PipelineError {
    /// Name of the stage at fault, if a stage is at fault.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailed { stage, .. } | PipelineError::StagePanicked { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }

    /// Closed queues are a symptom of some other stage dying.
    fn is_symptom(&self) -> bool {
        matches!(
            self,
            PipelineError::StageFailed {
                source: StageError::QueueClosed(_),
                ..
            }
        )
    }
}

/// Wires the stages of one run. Built fresh inside every `Pipeline` run.
type Link<In, Out> = dyn Fn(QueueReader<In>, QueueWriter<Out>, &mut RunContext) + Send + Sync;

/// What a stage task hands back to the executor.
enum StageOutcome {
    Finished(Result<(), StageError>),
    Panicked(String),
}

/// Per-run bookkeeping: the stage tasks and their meters, in pipeline order.
struct RunContext {
    capacity: usize,
    tasks: JoinSet<(usize, StageOutcome)>,
    meters: Vec<Arc<StageMeter>>,
}

impl RunContext {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tasks: JoinSet::new(),
            meters: Vec::new(),
        }
    }

    fn launch<S: Stage>(
        &mut self,
        stage: Arc<S>,
        input: QueueReader<S::Input>,
        output: QueueWriter<S::Output>,
    ) {
        let index = self.meters.len();
        let meter = Arc::new(StageMeter::new(stage.name()));
        self.meters.push(meter.clone());

        let span = tracing::debug_span!("stage", name = %stage.name(), index);
        self.tasks.spawn(
            async move {
                meter.start();
                // The stage future owns both queue ends; they drop with it
                // even when it unwinds.
                let outcome = AssertUnwindSafe(stage.run(input, output, meter.clone()))
                    .catch_unwind()
                    .await;
                let outcome = match outcome {
                    Ok(result) => StageOutcome::Finished(result),
                    Err(payload) => StageOutcome::Panicked(panic_message(payload)),
                };
                meter.finish(matches!(outcome, StageOutcome::Finished(Ok(()))));
                (index, outcome)
            }
            .instrument(span),
        );
    }
}

/// Extract a human-readable message from a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// An ordered, type-checked chain of stages.
///
/// Assembling is cheap and a pipeline can be run any number of times; runs
/// share the stage values but nothing else.
pub struct Pipeline<In, Out> {
    capacity: usize,
    names: Vec<String>,
    link: Arc<Link<In, Out>>,
}

impl<In, Out> Clone for Pipeline<In, Out> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            names: self.names.clone(),
            link: self.link.clone(),
        }
    }
}

impl<In, Out> std::fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("capacity", &self.capacity)
            .field("stages", &self.names)
            .finish()
    }
}

impl<In: Send + 'static, Out: Send + 'static> Pipeline<In, Out> {
    /// Start a pipeline with the default queue capacity.
    pub fn new<S>(first: S) -> Self
    where
        S: Stage<Input = In, Output = Out>,
    {
        Self::with_capacity(QUEUE_CAPACITY, first)
    }

    /// Start a pipeline whose queues hold at most `capacity` items each.
    pub fn with_capacity<S>(capacity: usize, first: S) -> Self
    where
        S: Stage<Input = In, Output = Out>,
    {
        let names = vec![first.name().to_string()];
        let first = Arc::new(first);
        let link = move |input: QueueReader<In>, output: QueueWriter<Out>, ctx: &mut RunContext| {
            ctx.launch(first.clone(), input, output);
        };
        Self {
            capacity: capacity.max(1),
            names,
            link: Arc::new(link),
        }
    }

    /// Append a stage. Its input type must be this pipeline's output type.
    pub fn then<S>(self, next: S) -> Pipeline<In, S::Output>
    where
        S: Stage<Input = Out>,
    {
        let mut names = self.names;
        names.push(next.name().to_string());

        let upstream = self.link;
        let next = Arc::new(next);
        let link = move |input: QueueReader<In>, output: QueueWriter<S::Output>, ctx: &mut RunContext| {
            let (writer, reader) = item_queue(ctx.capacity);
            upstream(input, writer, ctx);
            ctx.launch(next.clone(), reader, output);
        };
        Pipeline {
            capacity: self.capacity,
            names,
            link: Arc::new(link),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stage names in pipeline order.
    pub fn stage_names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Run every stage against caller-owned queue ends and wait until all of
    /// them have finished.
    ///
    /// The caller must keep feeding `input` and draining `output` while this
    /// runs, otherwise the bounded queues fill up and the run stalls.
    pub async fn execute(
        &self,
        input: QueueReader<In>,
        output: QueueWriter<Out>,
    ) -> Result<PipelineReport, PipelineError> {
        let mut ctx = RunContext::new(self.capacity);
        (self.link)(input, output, &mut ctx);
        tracing::debug!(stages = ctx.meters.len(), capacity = self.capacity, "pipeline launched");

        let mut errors = Vec::new();
        while let Some(joined) = ctx.tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Panics are caught inside the task, so this is a cancelled task.
                    tracing::error!(error = %e, "stage task lost");
                    errors.push(PipelineError::StagePanicked {
                        stage: "unknown".to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let stage = ctx.meters[index].name().to_string();
            match outcome {
                StageOutcome::Finished(Ok(())) => {}
                StageOutcome::Finished(Err(source)) => {
                    tracing::warn!(stage = %stage, error = %source, "stage failed");
                    errors.push(PipelineError::StageFailed { stage, source });
                }
                StageOutcome::Panicked(message) => {
                    tracing::error!(stage = %stage, message = %message, "stage panicked");
                    errors.push(PipelineError::StagePanicked { stage, message });
                }
            }
        }

        let report = PipelineReport {
            stages: ctx.meters.iter().map(|m| m.report()).collect(),
        };

        // Report the root cause rather than the stages that merely lost a peer.
        let root = match errors.iter().position(|e| !e.is_symptom()) {
            Some(i) => Some(errors.swap_remove(i)),
            None => errors.into_iter().next(),
        };
        match root {
            Some(err) => Err(err),
            None => {
                tracing::debug!(done = report.is_done(), "pipeline finished");
                Ok(report)
            }
        }
    }

    /// Feed `batch` into the pipeline and collect everything the last stage
    /// emits. Producer, stages and collector all run concurrently.
    pub async fn run<I>(&self, batch: I) -> Result<(Vec<Out>, PipelineReport), PipelineError>
    where
        I: IntoIterator<Item = In>,
    {
        let (input, source) = item_queue(self.capacity);
        let (sink, output) = item_queue(self.capacity);

        let produce = async move {
            for item in batch {
                if input.send(item).await.is_err() {
                    tracing::debug!("first stage stopped reading; producer gives up");
                    break;
                }
            }
        };

        let ((), report, items) = tokio::join!(produce, self.execute(source, sink), output.drain());
        Ok((items, report?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use signpipe_types::StageState;

    struct Double;

    #[async_trait]
    impl Stage for Double {
        type Input = u32;
        type Output = u32;

        fn name(&self) -> &str {
            "double"
        }

        async fn run(
            &self,
            mut input: QueueReader<u32>,
            output: QueueWriter<u32>,
            meter: Arc<StageMeter>,
        ) -> Result<(), StageError> {
            while let Some(n) = input.recv().await {
                meter.record_in();
                output.send(n * 2).await?;
                meter.record_out();
            }
            Ok(())
        }
    }

    struct Render;

    #[async_trait]
    impl Stage for Render {
        type Input = u32;
        type Output = String;

        fn name(&self) -> &str {
            "render"
        }

        async fn run(
            &self,
            mut input: QueueReader<u32>,
            output: QueueWriter<String>,
            _meter: Arc<StageMeter>,
        ) -> Result<(), StageError> {
            while let Some(n) = input.recv().await {
                output.send(format!("<{n}>")).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = Pipeline::with_capacity(2, Double).then(Double).then(Render);
        assert_eq!(pipeline.stage_names(), ["double", "double", "render"]);

        let (items, report) = pipeline.run(1..=5).await.unwrap();
        assert_eq!(items, ["<4>", "<8>", "<12>", "<16>", "<20>"]);
        assert!(report.is_done());
        assert_eq!(report.stages[0].items_in, 5);
        assert_eq!(report.stages[1].items_out, 5);
    }

    #[tokio::test]
    async fn test_pipeline_is_reusable() {
        let pipeline = Pipeline::new(Double).then(Render);
        let (first, _) = pipeline.run([1, 2]).await.unwrap();
        let (second, _) = pipeline.clone().run([1, 2]).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_batch_closes_cleanly() {
        let (items, report) = Pipeline::new(Double).run(Vec::new()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(report.stages[0].state, StageState::Closed);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "non-string panic payload");
    }

    #[test]
    fn test_queue_closed_is_a_symptom() {
        let symptom = PipelineError::StageFailed {
            stage: "a".into(),
            source: StageError::QueueClosed(crate::queue::QueueClosed),
        };
        assert!(symptom.is_symptom());
        assert_eq!(symptom.stage(), Some("a"));
        assert!(!PipelineError::NoOutput.is_symptom());
    }
}
