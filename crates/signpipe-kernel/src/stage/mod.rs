//! Pipeline stages.
//!
//! A stage reads items from its input queue until end-of-stream and writes
//! results to its output queue. Input and output item types are associated
//! types, so a pipeline whose adjacent stages disagree does not compile.
//!
//! ```text
//!   i64 ──▶ SingleHash ──▶ ItemResult<String> ──▶ MultiHash ──▶ ItemResult<String> ──▶ CombineResults ──▶ BatchReport
//!            (gate: md5)                                                                 (sort + join)
//! ```

mod combine;
mod fanout;
mod multi_hash;
mod single_hash;

pub use combine::{CombineResults, JOIN_SEPARATOR, combine};
pub use fanout::FanOut;
pub use multi_hash::{MULTI_HASH_WAYS, MultiHash, multi_hash};
pub use single_hash::{SingleHash, single_hash};

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use signpipe_types::{StageReport, StageState};

use crate::queue::{QueueClosed, QueueReader, QueueWriter};

/// Why a stage task stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The downstream reader went away.
    #[error("output queue closed")]
    QueueClosed(#[from] QueueClosed),
    /// A per-item sub-task died or could not be scheduled.
    #[error("sub-task failed: {0}")]
    SubTask(String),
}

/// One step of a pipeline.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Consume `input` to exhaustion, writing results to `output`.
    ///
    /// The output queue closes when `output` and every clone of it are
    /// dropped, so implementations must not leak writer handles past return.
    async fn run(
        &self,
        input: QueueReader<Self::Input>,
        output: QueueWriter<Self::Output>,
        meter: Arc<StageMeter>,
    ) -> Result<(), StageError>;
}

/// Live counters and state for one stage in one run.
#[derive(Debug)]
pub struct StageMeter {
    name: String,
    items_in: AtomicU64,
    items_out: AtomicU64,
    failed: AtomicU64,
    state: AtomicU8,
    started: Mutex<Option<Instant>>,
    elapsed: Mutex<Duration>,
}

impl StageMeter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items_in: AtomicU64::new(0),
            items_out: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            state: AtomicU8::new(encode_state(StageState::Idle)),
            started: Mutex::new(None),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_in(&self) {
        self.items_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.items_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> StageState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`, logging the transition.
    pub fn set_state(&self, state: StageState) {
        let previous = decode_state(self.state.swap(encode_state(state), Ordering::AcqRel));
        if previous != state {
            tracing::debug!(stage = %self.name, from = %previous, to = %state, "stage state");
        }
    }

    /// Idle → Running; starts the clock.
    pub fn start(&self) {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.set_state(StageState::Running);
    }

    /// Running/Draining → Closed or Failed; stops the clock.
    pub fn finish(&self, ok: bool) {
        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(started) = started {
            *self.elapsed.lock().unwrap_or_else(|e| e.into_inner()) = started.elapsed();
        }
        self.set_state(if ok { StageState::Closed } else { StageState::Failed });
    }

    pub fn report(&self) -> StageReport {
        StageReport {
            name: self.name.clone(),
            items_in: self.items_in.load(Ordering::Relaxed),
            items_out: self.items_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed: *self.elapsed.lock().unwrap_or_else(|e| e.into_inner()),
            state: self.state(),
        }
    }
}

fn encode_state(state: StageState) -> u8 {
    match state {
        StageState::Idle => 0,
        StageState::Running => 1,
        StageState::Draining => 2,
        StageState::Closed => 3,
        StageState::Failed => 4,
    }
}

fn decode_state(raw: u8) -> StageState {
    match raw {
        0 => StageState::Idle,
        1 => StageState::Running,
        2 => StageState::Draining,
        3 => StageState::Closed,
        _ => StageState::Failed,
    }
}
