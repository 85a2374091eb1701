//! Stable sequence sources
//!
//! The stable sequence is the highest sequence below which every allocated
//! sequence has been durably written to the index. Readers never see
//! entries above it.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::storage::{parse_counter, Bucket, Cas};
use crate::Result;

#[async_trait]
pub trait StableSequenceSource: Send + Sync {
    async fn stable_sequence(&self) -> Result<u64>;
}

#[async_trait]
impl<F> StableSequenceSource for F
where
    F: Fn() -> Result<u64> + Send + Sync,
{
    async fn stable_sequence(&self) -> Result<u64> {
        self()
    }
}

/// Reads the stable sequence from a decimal counter kept in the bucket.
/// A missing counter reads as 0.
pub struct BucketStableSequence {
    bucket: Arc<dyn Bucket>,
    key: String,
}

impl BucketStableSequence {
    pub fn new(bucket: Arc<dyn Bucket>, key: impl Into<String>) -> Self {
        Self {
            bucket,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raise the stored value to `stable`. A lower value leaves it
    /// unchanged. Returns the value in effect afterwards.
    pub async fn advance(&self, stable: u64) -> Result<u64> {
        loop {
            let (current, cas) = match self.bucket.get_raw(&self.key).await {
                Ok((data, cas)) => (parse_counter(&self.key, &data)?, cas),
                Err(e) if e.is_not_found() => (0, Cas::none()),
                Err(e) => return Err(e),
            };
            if stable <= current {
                return Ok(current);
            }

            match self
                .bucket
                .write_cas(&self.key, Bytes::from(stable.to_string()), &cas)
                .await
            {
                Ok(_) => {
                    tracing::debug!(key = %self.key, stable, "Stable sequence advanced");
                    return Ok(stable);
                }
                Err(e) if e.is_cas_mismatch() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StableSequenceSource for BucketStableSequence {
    async fn stable_sequence(&self) -> Result<u64> {
        match self.bucket.get(&self.key).await {
            Ok(data) => parse_counter(&self.key, &data),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }
}
