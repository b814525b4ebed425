//! Six-way hash stage: `x` → `crc32("0"+x) ++ crc32("1"+x) ++ … ++ crc32("5"+x)`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use signpipe_types::{ItemFailure, ItemResult, SignerError, SignerResult, StageState};

use super::{FanOut, Stage, StageError, StageMeter};
use crate::queue::{QueueReader, QueueWriter};
use crate::signer::Signer;

/// Number of salted digests concatenated per item.
pub const MULTI_HASH_WAYS: usize = 6;

/// Expands each signed item into six concatenated, index-salted crc32 digests.
pub struct MultiHash {
    signer: Arc<dyn Signer>,
    max_in_flight: usize,
}

impl MultiHash {
    pub const NAME: &'static str = "multi_hash";

    pub fn new(signer: Arc<dyn Signer>, max_in_flight: usize) -> Self {
        Self {
            signer,
            max_in_flight,
        }
    }
}

/// Compute the six salted digests concurrently and concatenate them in
/// index order.
///
/// Each sub-task owns one slot; only this function reads the slots, after
/// every sub-task has finished.
pub async fn multi_hash(signer: Arc<dyn Signer>, data: &str) -> SignerResult<String> {
    let mut tasks = JoinSet::new();
    for th in 0..MULTI_HASH_WAYS {
        let signer = signer.clone();
        let salted = format!("{th}{data}");
        tasks.spawn(async move { (th, signer.crc32(&salted).await) });
    }

    let mut slots: [Option<String>; MULTI_HASH_WAYS] = Default::default();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((th, Ok(digest))) => slots[th] = Some(digest),
            Ok((_, Err(e))) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(SignerError::TaskFailed(e.to_string()));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| SignerError::TaskFailed("missing digest".to_string())))
        .collect()
}

#[async_trait]
impl Stage for MultiHash {
    type Input = ItemResult<String>;
    type Output = ItemResult<String>;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &self,
        mut input: QueueReader<ItemResult<String>>,
        output: QueueWriter<ItemResult<String>>,
        meter: Arc<StageMeter>,
    ) -> Result<(), StageError> {
        let mut pool = FanOut::new(self.max_in_flight);

        while let Some(item) = input.recv().await {
            meter.record_in();
            let data = match item {
                Ok(data) => data,
                Err(failure) => {
                    // Upstream already gave up on this item; pass it along.
                    meter.record_failure();
                    output.send(Err(failure)).await?;
                    meter.record_out();
                    continue;
                }
            };

            let signer = self.signer.clone();
            let output = output.clone();
            let meter = meter.clone();

            pool.spawn(async move {
                let result = multi_hash(signer, &data)
                    .await
                    .map_err(|error| ItemFailure::new(MultiHash::NAME, data.as_str(), error));
                match &result {
                    Ok(hash) => tracing::trace!(data = %data, hash = %hash, "multi hash"),
                    Err(failure) => {
                        tracing::warn!(%failure, "multi hash failed");
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
        pool.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item_queue;
    use crate::signer::{DataSigner, SignerConfig, crc32_digest};
    use async_trait::async_trait;
    use std::time::Duration;

    /// crc32 whose latency shrinks with the salt index, so slot 5 finishes
    /// first and slot 0 last.
    struct Reversed;

    #[async_trait]
    impl Signer for Reversed {
        async fn crc32(&self, data: &str) -> SignerResult<String> {
            let salt = data.chars().next().and_then(|c| c.to_digit(10)).unwrap_or(0) as u64;
            tokio::time::sleep(Duration::from_millis((6 - salt) * 5)).await;
            Ok(crc32_digest(data))
        }

        async fn md5(&self, _data: &str) -> SignerResult<String> {
            unreachable!("multi hash never calls md5")
        }
    }

    fn expected(data: &str) -> String {
        (0..MULTI_HASH_WAYS)
            .map(|th| crc32_digest(&format!("{th}{data}")))
            .collect()
    }

    #[tokio::test]
    async fn test_concatenation_in_index_order() {
        let signer: Arc<dyn Signer> = Arc::new(DataSigner::new(SignerConfig::instant()));
        let hash = multi_hash(signer, "4108050209~502633748").await.unwrap();
        assert_eq!(hash, expected("4108050209~502633748"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_independent_of_completion() {
        let hash = multi_hash(Arc::new(Reversed), "abc").await.unwrap();
        assert_eq!(hash, expected("abc"));
    }

    #[tokio::test]
    async fn test_failures_pass_through() {
        let signer: Arc<dyn Signer> = Arc::new(DataSigner::new(SignerConfig::instant()));
        let stage = MultiHash::new(signer, 4);
        let meter = Arc::new(StageMeter::new(MultiHash::NAME));

        let (in_w, in_r) = item_queue(4);
        let (out_w, out_r) = item_queue(4);
        let failure = ItemFailure::new("single_hash", "9", SignerError::Closed);
        in_w.send(Err(failure.clone())).await.unwrap();
        in_w.send(Ok("x".to_string())).await.unwrap();
        drop(in_w);

        stage.run(in_r, out_w, meter.clone()).await.unwrap();
        let mut results = out_r.drain().await;
        results.sort_by_key(|r| r.is_ok());

        assert_eq!(results[0], Err(failure));
        assert_eq!(results[1], Ok(expected("x")));
        assert_eq!(meter.report().failed, 1);
        assert_eq!(meter.report().items_out, 2);
    }
}
