//! Bucket abstraction layer
//!
//! The index consumes a key-value bucket with get / CAS / increment primitives.
//! Two backends are provided: an in-process map and S3 conditional writes.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::{Error, Result};

pub mod memory;
pub mod s3;

/// Version token for a stored value.
///
/// An empty token means "the key must not exist yet" when passed to
/// [`Bucket::write_cas`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Cas(Option<String>);

impl Cas {
    pub fn none() -> Self {
        Cas(None)
    }

    pub fn new(token: impl Into<String>) -> Self {
        Cas(Some(token.into()))
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(token) => f.write_str(token),
            None => f.write_str("<none>"),
        }
    }
}

/// Bucket backend trait
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Read a value. Missing keys are reported as [`Error::NotFound`].
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Read a value together with its CAS token
    async fn get_raw(&self, key: &str) -> Result<(Bytes, Cas)>;

    /// Unconditionally write a value
    async fn set(&self, key: &str, data: Bytes) -> Result<Cas>;

    /// Write a value only if the stored token still matches `cas`.
    ///
    /// A lost race is reported as [`Error::CasMismatch`].
    async fn write_cas(&self, key: &str, data: Bytes, cas: &Cas) -> Result<Cas>;

    /// Delete a value; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically add `delta` to a decimal counter, creating it with `initial`
    /// when missing. Returns the new value.
    async fn incr(&self, key: &str, delta: u64, initial: u64) -> Result<u64> {
        loop {
            let (next, cas) = match self.get_raw(key).await {
                Ok((data, cas)) => (parse_counter(key, &data)?.saturating_add(delta), cas),
                Err(e) if e.is_not_found() => (initial, Cas::none()),
                Err(e) => return Err(e),
            };

            match self
                .write_cas(key, Bytes::from(next.to_string()), &cas)
                .await
            {
                Ok(_) => return Ok(next),
                Err(e) if e.is_cas_mismatch() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Parse a decimal counter value
pub fn parse_counter(key: &str, data: &[u8]) -> Result<u64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::decode(format!("counter {} is not a decimal integer", key)))
}

/// Bucket configuration
#[derive(Debug, Clone)]
pub enum BucketConfig {
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
    Memory,
}

/// Create bucket backend from config
pub async fn create_bucket(config: BucketConfig) -> Result<Box<dyn Bucket>> {
    match config {
        BucketConfig::S3 {
            bucket,
            region,
            endpoint,
        } => {
            let backend = s3::S3Bucket::new(bucket, region, endpoint).await?;
            Ok(Box::new(backend))
        }
        BucketConfig::Memory => Ok(Box::new(memory::MemoryBucket::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("k", b"42").unwrap(), 42);
        assert_eq!(parse_counter("k", b" 7\n").unwrap(), 7);
        assert!(parse_counter("k", b"x").is_err());
    }

    #[test]
    fn test_cas_display() {
        assert_eq!(Cas::none().to_string(), "<none>");
        assert_eq!(Cas::new("\"etag\"").token(), Some("\"etag\""));
    }
}
