//! Dual-hash stage: `n` → `crc32(n) ~ crc32(md5(n))`.

use std::sync::Arc;

use async_trait::async_trait;

use signpipe_types::{ItemFailure, ItemResult, SignerError, SignerResult, StageState};

use super::{FanOut, Stage, StageError, StageMeter};
use crate::gate::Gate;
use crate::queue::{QueueReader, QueueWriter};
use crate::signer::Signer;

/// Signs integers with two crc32 digests, one of them over the md5 digest.
///
/// A fresh `Gate` is created for every run, and only the md5 call holds it.
/// Both crc32 calls run outside it, overlapping the serialized md5 work.
pub struct SingleHash {
    signer: Arc<dyn Signer>,
    md5_permits: usize,
    max_in_flight: usize,
}

impl SingleHash {
    pub const NAME: &'static str = "single_hash";

    pub fn new(signer: Arc<dyn Signer>, md5_permits: usize, max_in_flight: usize) -> Self {
        Self {
            signer,
            md5_permits,
            max_in_flight,
        }
    }
}

/// Compute `"<crc32(data)>~<crc32(md5(data))>"`.
///
/// The two halves run as separate tasks; `gate` is held for the md5 call
/// alone.
pub async fn single_hash(
    signer: Arc<dyn Signer>,
    gate: Arc<Gate>,
    data: &str,
) -> SignerResult<String> {
    let crc = tokio::spawn({
        let signer = signer.clone();
        let data = data.to_string();
        async move { signer.crc32(&data).await }
    });
    let md5_crc = tokio::spawn({
        let data = data.to_string();
        async move {
            let md5 = {
                let _permit = gate.acquire().await?;
                signer.md5(&data).await?
            };
            signer.crc32(&md5).await
        }
    });

    let (crc, md5_crc) = tokio::join!(crc, md5_crc);
    let crc = crc.map_err(|e| SignerError::TaskFailed(e.to_string()))??;
    let md5_crc = md5_crc.map_err(|e| SignerError::TaskFailed(e.to_string()))??;
    Ok(format!("{crc}~{md5_crc}"))
}

#[async_trait]
impl Stage for SingleHash {
    type Input = i64;
    type Output = ItemResult<String>;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        mut input: QueueReader<i64>,
        output: QueueWriter<ItemResult<String>>,
        meter: Arc<StageMeter>,
    ) -> Result<(), StageError> {
        let gate = Arc::new(Gate::new(self.md5_permits));
        let mut pool = FanOut::new(self.max_in_flight);

        while let Some(value) = input.recv().await {
            meter.record_in();
            let data = value.to_string();
            let signer = self.signer.clone();
            let gate = gate.clone();
            let output = output.clone();
            let meter = meter.clone();

            pool.spawn(async move {
                let result = single_hash(signer, gate, &data)
                    .await
                    .map_err(|error| ItemFailure::new(SingleHash::NAME, data.as_str(), error));
                match &result {
                    Ok(hash) => tracing::trace!(data = %data, hash = %hash, "single hash"),
                    Err(failure) => {
                        tracing::warn!(%failure, "single hash failed");
                        meter.record_failure();
                    }
                }
                output.send(result).await?;
                meter.record_out();
                Ok(())
            })
            .await?;
        }

        meter.set_state(StageState::Draining);
        let joined = pool.join().await;
        tracing::debug!(gate_peak = gate.peak(), permits = gate.permits(), "single hash drained");
        joined
    }
}
