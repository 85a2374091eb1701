//! In-process bucket backend
//!
//! Backs single-node deployments and tests. CAS tokens are a per-bucket
//! monotonically increasing version, so every write yields a fresh token.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{Error, Result};

use super::{parse_counter, Bucket, Cas};

/// In-memory bucket
#[derive(Default)]
pub struct MemoryBucket {
    items: RwLock<HashMap<String, (Bytes, u64)>>,
    version: AtomicU64,
    failing_writes: AtomicU32,
    cas_conflicts: AtomicU64,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a storage error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of conditional writes rejected because of a stale token
    pub fn cas_conflicts(&self) -> u64 {
        self.cas_conflicts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_injected_failure(&self, key: &str) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::storage(format!("injected write failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.items
            .read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn get_raw(&self, key: &str) -> Result<(Bytes, Cas)> {
        self.items
            .read()
            .get(key)
            .map(|(data, version)| (data.clone(), Cas::new(version.to_string())))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<Cas> {
        self.check_injected_failure(key)?;
        let version = self.next_version();
        self.items.write().insert(key.to_string(), (data, version));
        Ok(Cas::new(version.to_string()))
    }

    async fn write_cas(&self, key: &str, data: Bytes, cas: &Cas) -> Result<Cas> {
        self.check_injected_failure(key)?;

        let mut items = self.items.write();
        let current = items.get(key).map(|(_, version)| version.to_string());
        if current.as_deref() != cas.token() {
            self.cas_conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(Error::CasMismatch(key.to_string()));
        }

        let version = self.next_version();
        items.insert(key.to_string(), (data, version));
        Ok(Cas::new(version.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.items.write().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: u64, initial: u64) -> Result<u64> {
        self.check_injected_failure(key)?;

        let mut items = self.items.write();
        let next = match items.get(key) {
            Some((data, _)) => parse_counter(key, data)?.saturating_add(delta),
            None => initial,
        };
        let version = self.next_version();
        items.insert(key.to_string(), (Bytes::from(next.to_string()), version));
        Ok(next)
    }
}
