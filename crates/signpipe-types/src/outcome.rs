//! Per-item outcomes flowing between pipeline stages.
//!
//! A stage never aborts the batch because one item could not be signed.
//! Instead it emits `Err(ItemFailure)` in that item's place and downstream
//! stages pass it through untouched until the aggregator tallies it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SignerError;

/// One item's result as it travels down the pipeline.
pub type ItemResult<T> = Result<T, ItemFailure>;

/// Record of an item that could not be signed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage}: item {input:?}: {error}")]
pub struct ItemFailure {
    /// Name of the stage where the item failed.
    pub stage: String,
    /// The item as that stage received it, rendered as text.
    pub input: String,
    /// What went wrong.
    pub error: SignerError,
}

impl ItemFailure {
    pub fn new(stage: impl Into<String>, input: impl Into<String>, error: SignerError) -> Self {
        Self {
            stage: stage.into(),
            input: input.into(),
            error,
        }
    }
}
