//! signpipe-kernel: the concurrent bulk data-signing pipeline.
//!
//! This crate provides:
//!
//! - **Queue**: bounded item queues with backpressure between stages
//! - **Gate**: a permit pool serializing access to the rate-limited md5 call
//! - **Signer**: the digest provider trait, a simulated backend, and retries
//! - **Stages**: `SingleHash`, `MultiHash` and the `CombineResults` aggregator
//! - **Pipeline**: the executor chaining type-checked stages
//! - **Config**: `PipelineConfig`, loaded from `~/.config/signpipe/config.toml`
//!
//! ```no_run
//! # async fn demo() -> Result<(), signpipe_kernel::PipelineError> {
//! let joined = signpipe_kernel::run_signing_pipeline(&[0, 1, 1, 2, 3, 5, 8]).await?;
//! println!("{joined}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod gate;
pub mod kernel;
pub mod pipeline;
pub mod queue;
pub mod signer;
pub mod stage;

pub use config::PipelineConfig;
pub use gate::{Gate, GateClosed, GatePermit};
pub use kernel::{SigningKernel, SigningPipeline, build_pipeline, run_signing_pipeline, sign_batch};
pub use pipeline::{Pipeline, PipelineError};
pub use queue::{QUEUE_CAPACITY, QueueClosed, QueueReader, QueueWriter, item_queue};
pub use signer::{
    DataSigner, RetryPolicy, RetryingSigner, Signer, SignerConfig, SignerStats, crc32_digest,
    md5_digest,
};
pub use stage::{CombineResults, MultiHash, SingleHash, Stage, StageError, StageMeter};

// Data types, for embedders that only depend on the kernel
pub use signpipe_types::{
    BatchReport, ItemFailure, ItemResult, PipelineReport, SignerError, SignerResult, StageReport,
    StageState,
};
