//! The signing kernel: the assembled three-stage pipeline plus its signer.
//!
//! ```text
//!   batch ──▶ SingleHash ──▶ MultiHash ──▶ CombineResults ──▶ BatchReport
//!                 │               │
//!                 └── RetryingSigner ── Signer (DataSigner by default)
//! ```

use std::sync::Arc;

use signpipe_types::{BatchReport, PipelineReport};

use crate::config::PipelineConfig;
use crate::pipeline::{Pipeline, PipelineError};
use crate::signer::{DataSigner, RetryingSigner, Signer, SignerStats};
use crate::stage::{CombineResults, MultiHash, SingleHash};

/// The pipeline every kernel runs: integers in, one report out.
pub type SigningPipeline = Pipeline<i64, BatchReport>;

/// Assemble `SingleHash → MultiHash → CombineResults` over `signer`.
pub fn build_pipeline(config: &PipelineConfig, signer: Arc<dyn Signer>) -> SigningPipeline {
    Pipeline::with_capacity(
        config.queue_capacity,
        SingleHash::new(signer.clone(), config.md5_permits, config.max_in_flight),
    )
    .then(MultiHash::new(signer, config.max_in_flight))
    .then(CombineResults::new(config.queue_capacity))
}

/// A configured signing pipeline, reusable across batches.
pub struct SigningKernel {
    config: PipelineConfig,
    pipeline: SigningPipeline,
    /// Set when the kernel owns the simulated backend, for stats.
    backend: Option<Arc<DataSigner>>,
}

impl SigningKernel {
    /// Kernel over a simulated `DataSigner` built from `config.signer`.
    pub fn new(config: PipelineConfig) -> Self {
        let backend = Arc::new(DataSigner::new(config.signer.clone()));
        Self::assemble(config, backend.clone(), Some(backend))
    }

    /// Kernel over a caller-supplied signer.
    pub fn with_signer(config: PipelineConfig, signer: Arc<dyn Signer>) -> Self {
        Self::assemble(config, signer, None)
    }

    fn assemble(
        config: PipelineConfig,
        signer: Arc<dyn Signer>,
        backend: Option<Arc<DataSigner>>,
    ) -> Self {
        let signer: Arc<dyn Signer> = Arc::new(RetryingSigner::new(signer, config.retry));
        let pipeline = build_pipeline(&config, signer);
        tracing::debug!(?pipeline, "signing kernel assembled");
        Self {
            config,
            pipeline,
            backend,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &SigningPipeline {
        &self.pipeline
    }

    /// Counters of the simulated backend, if this kernel owns one.
    pub fn signer_stats(&self) -> Option<SignerStats> {
        self.backend.as_ref().map(|b| b.stats())
    }

    /// Sign `batch` and return the aggregate report with per-stage counters.
    #[tracing::instrument(level = "info", skip(self, batch), fields(items = batch.len()))]
    pub async fn sign_batch_detailed(
        &self,
        batch: &[i64],
    ) -> Result<(BatchReport, PipelineReport), PipelineError> {
        let (mut reports, stages) = self.pipeline.run(batch.to_vec()).await?;
        let report = reports.pop().ok_or(PipelineError::NoOutput)?;

        for stage in &stages.stages {
            tracing::debug!(
                stage = %stage.name,
                items_in = stage.items_in,
                items_out = stage.items_out,
                failed = stage.failed,
                elapsed = ?stage.elapsed,
                "stage report"
            );
        }
        if !report.is_complete() {
            tracing::warn!(failed = report.failures.len(), total = report.total(), "batch partially signed");
        }
        Ok((report, stages))
    }

    /// Sign `batch`. Items that could not be signed are listed in the report
    /// instead of failing the call.
    pub async fn sign_batch(&self, batch: &[i64]) -> Result<BatchReport, PipelineError> {
        let (report, _) = self.sign_batch_detailed(batch).await?;
        Ok(report)
    }

    /// Sign `batch` and return the joined string, or `PartialFailure` if any
    /// item could not be signed.
    pub async fn run(&self, batch: &[i64]) -> Result<String, PipelineError> {
        let report = self.sign_batch(batch).await?;
        if report.is_complete() {
            Ok(report.joined)
        } else {
            Err(PipelineError::PartialFailure(Box::new(report)))
        }
    }
}

/// Sign `batch` through `signer` with `config`, reporting partial success.
pub async fn sign_batch(
    batch: &[i64],
    config: &PipelineConfig,
    signer: Arc<dyn Signer>,
) -> Result<BatchReport, PipelineError> {
    SigningKernel::with_signer(config.clone(), signer)
        .sign_batch(batch)
        .await
}

/// Sign `batch` with the default configuration and simulated signer.
pub async fn run_signing_pipeline(batch: &[i64]) -> Result<String, PipelineError> {
    SigningKernel::new(PipelineConfig::default()).run(batch).await
}
