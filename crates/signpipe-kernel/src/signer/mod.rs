//! The external signer: crc32 and md5 digests behind an async trait.
//!
//! `DataSigner` simulates a backing service. Both operations carry a
//! configurable latency, and md5 models a backend that serves one request at
//! a time: with `overheat_check` on, a second concurrent md5 call fails with
//! `SignerError::Overheat`. Callers are expected to serialize md5 through a
//! `Gate`; the signer only detects when they don't.

mod retry;

pub use retry::{RetryPolicy, RetryingSigner};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use signpipe_types::{SignerError, SignerResult};

/// Digest provider used by the hash stages.
#[async_trait]
pub trait Signer: Send + Sync {
    /// CRC-32 (IEEE) of `data`, rendered as an unpadded decimal.
    /// Cheap and safe to call concurrently.
    async fn crc32(&self, data: &str) -> SignerResult<String>;

    /// MD5 of `data`, rendered as 32 lowercase hex characters.
    /// Expensive; callers limit concurrency.
    async fn md5(&self, data: &str) -> SignerResult<String>;
}

#[async_trait]
impl<S: Signer + ?Sized> Signer for Arc<S> {
    async fn crc32(&self, data: &str) -> SignerResult<String> {
        (**self).crc32(data).await
    }

    async fn md5(&self, data: &str) -> SignerResult<String> {
        (**self).md5(data).await
    }
}

/// CRC-32 digest as the signer renders it.
pub fn crc32_digest(data: &str) -> String {
    crc32fast::hash(data.as_bytes()).to_string()
}

/// MD5 digest as the signer renders it.
pub fn md5_digest(data: &str) -> String {
    hex::encode(Md5::digest(data.as_bytes()))
}

/// Tuning for the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Simulated latency of one crc32 call in milliseconds.
    #[serde(default = "default_crc32_latency")]
    pub crc32_latency_ms: u64,

    /// Simulated latency of one md5 call in milliseconds.
    #[serde(default = "default_md5_latency")]
    pub md5_latency_ms: u64,

    /// Fail md5 calls that overlap another md5 call.
    #[serde(default = "default_overheat_check")]
    pub overheat_check: bool,
}

fn default_crc32_latency() -> u64 {
    1_000
}

fn default_md5_latency() -> u64 {
    10
}

fn default_overheat_check() -> bool {
    true
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            crc32_latency_ms: default_crc32_latency(),
            md5_latency_ms: default_md5_latency(),
            overheat_check: default_overheat_check(),
        }
    }
}

impl SignerConfig {
    /// No simulated latency. Overheat detection stays on.
    pub fn instant() -> Self {
        Self {
            crc32_latency_ms: 0,
            md5_latency_ms: 0,
            ..Self::default()
        }
    }
}

/// Point-in-time copy of a signer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerStats {
    pub crc32_calls: u64,
    pub md5_calls: u64,
    /// Most md5 calls ever observed in progress at the same time.
    pub md5_peak_concurrency: usize,
}

#[derive(Debug, Default)]
struct Counters {
    crc32_calls: AtomicU64,
    md5_calls: AtomicU64,
    md5_active: AtomicUsize,
    md5_peak: AtomicUsize,
}

/// Decrements the active md5 count however the call ends.
struct ActiveMd5<'a>(&'a AtomicUsize);

impl Drop for ActiveMd5<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated rate-limited signing backend.
#[derive(Debug, Default)]
pub struct DataSigner {
    config: SignerConfig,
    counters: Counters,
}

impl DataSigner {
    pub fn new(config: SignerConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    pub fn stats(&self) -> SignerStats {
        SignerStats {
            crc32_calls: self.counters.crc32_calls.load(Ordering::Relaxed),
            md5_calls: self.counters.md5_calls.load(Ordering::Relaxed),
            md5_peak_concurrency: self.counters.md5_peak.load(Ordering::SeqCst),
        }
    }

    async fn simulate(latency_ms: u64) {
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }
}

#[async_trait]
impl Signer for DataSigner {
    async fn crc32(&self, data: &str) -> SignerResult<String> {
        self.counters.crc32_calls.fetch_add(1, Ordering::Relaxed);
        Self::simulate(self.config.crc32_latency_ms).await;
        let digest = crc32_digest(data);
        tracing::trace!(data, digest = %digest, "crc32");
        Ok(digest)
    }

    async fn md5(&self, data: &str) -> SignerResult<String> {
        self.counters.md5_calls.fetch_add(1, Ordering::Relaxed);
        let active = self.counters.md5_active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveMd5(&self.counters.md5_active);
        self.counters.md5_peak.fetch_max(active, Ordering::SeqCst);

        if self.config.overheat_check && active > 1 {
            tracing::warn!(concurrent = active, "md5 overheated");
            return Err(SignerError::Overheat { concurrent: active });
        }

        Self::simulate(self.config.md5_latency_ms).await;
        let digest = md5_digest(data);
        tracing::trace!(data, digest = %digest, "md5");
        Ok(digest)
    }
}
