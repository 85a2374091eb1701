//! Channel change index
//!
//! Ties together:
//! - Partition map (vbucket -> partition routing)
//! - Index blocks (per channel, partition and sequence range)
//! - Block cache
//! - Per-channel polling and change notification

pub mod block;
pub mod cache;
pub mod channel;
pub mod keys;
pub mod kv;
pub mod notify;
pub mod partition;
pub mod stable;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::Bucket;
use crate::types::{CachedChanges, ChangesOptions, LogEntry, SequenceId, VbNo};
use crate::{Error, Result};

pub use block::{BlockId, EntryState, IndexBlock, IndexEntry};
pub use cache::BlockCache;
pub use channel::KvChannelIndex;
pub use keys::IndexKeys;
pub use kv::{KvChangeIndex, Mutation};
pub use notify::{ChangeNotifier, ChangeReceiver};
pub use partition::IndexPartitionMap;
pub use stable::{BucketStableSequence, StableSequenceSource};

/// Largest supported block capacity; a block holds two bits per sequence
pub const MAX_BLOCK_CAPACITY: u64 = 1 << 24;

/// Tuning for the channel index
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Prefix for every bucket key the index owns
    pub key_prefix: String,

    /// Sequences per index block (default: 10000). Must match across nodes.
    pub block_capacity: u64,

    pub num_vbuckets: u16,
    pub num_partitions: u16,

    /// Sleep between poll cycles (default: 1s)
    pub poll_interval: Duration,

    /// Blocks kept in each channel's cache (default: 1024)
    pub cache_max_blocks: usize,

    /// Attempts per CAS block update before giving up (default: 100)
    pub max_cas_retries: u32,
    pub cas_backoff_base: Duration,
    pub cas_backoff_max: Duration,

    pub notify_queue_capacity: usize,

    /// Also index every document into the `*` channel
    pub index_star_channel: bool,

    /// Start a poll loop for each channel on first touch
    pub poll_enabled: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            key_prefix: "_idx".to_string(),
            block_capacity: 10_000,
            num_vbuckets: 1024,
            num_partitions: 64,
            poll_interval: Duration::from_millis(1000),
            cache_max_blocks: 1024,
            max_cas_retries: 100,
            cas_backoff_base: Duration::from_millis(1),
            cas_backoff_max: Duration::from_millis(100),
            notify_queue_capacity: 1024,
            index_star_channel: true,
            poll_enabled: true,
        }
    }
}

impl IndexOptions {
    /// Small blocks, few partitions, no background polling
    pub fn for_testing() -> Self {
        Self {
            key_prefix: "_idx".to_string(),
            block_capacity: 100,
            num_vbuckets: 16,
            num_partitions: 4,
            poll_interval: Duration::from_millis(10),
            cache_max_blocks: 64,
            max_cas_retries: 100,
            cas_backoff_base: Duration::ZERO,
            cas_backoff_max: Duration::ZERO,
            notify_queue_capacity: 64,
            index_star_channel: true,
            poll_enabled: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_capacity == 0 || self.block_capacity > MAX_BLOCK_CAPACITY {
            return Err(Error::index(format!(
                "block_capacity must be between 1 and {}",
                MAX_BLOCK_CAPACITY
            )));
        }
        if self.num_vbuckets == 0 || self.num_partitions == 0 {
            return Err(Error::index(
                "num_vbuckets and num_partitions must be greater than 0",
            ));
        }
        if self.num_partitions > self.num_vbuckets {
            return Err(Error::index(format!(
                "num_partitions ({}) cannot exceed num_vbuckets ({})",
                self.num_partitions, self.num_vbuckets
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(Error::index("key_prefix cannot be empty"));
        }
        Ok(())
    }
}

/// State shared by every channel index of one change index
pub struct IndexContext {
    pub bucket: Arc<dyn Bucket>,
    pub keys: IndexKeys,
    pub partition_map: Arc<IndexPartitionMap>,
    pub stable_source: Arc<dyn StableSequenceSource>,
    pub notifier: ChangeNotifier,
    pub options: IndexOptions,
    /// Last sequence the caller had already processed at init
    pub start_sequence: u64,
    /// Upper bound for reads on every channel; only ever raised
    pub stable_sequence: AtomicU64,
}

impl IndexContext {
    pub fn stable_sequence(&self) -> u64 {
        self.stable_sequence.load(Ordering::Acquire)
    }

    /// Raise the shared bound to `stable` and return the bound in effect
    pub fn raise_stable_sequence(&self, stable: u64) -> u64 {
        self.stable_sequence
            .fetch_max(stable, Ordering::AcqRel)
            .max(stable)
    }
}

/// Per-channel change history over a shared bucket
#[async_trait]
pub trait ChangeIndex: Send + Sync {
    async fn init(
        &self,
        last_sequence: u64,
        stable_source: Arc<dyn StableSequenceSource>,
        notifier: ChangeNotifier,
        options: IndexOptions,
    ) -> Result<()>;

    /// Signal every poll loop to exit
    fn stop(&self);

    /// Stop and drop all per-channel state
    fn clear(&self);

    fn enable_channel_indexing(&self, enabled: bool);

    /// Durable range read, clamped to the stable sequence
    async fn get_changes(&self, channel: &str, options: &ChangesOptions) -> Result<Vec<LogEntry>>;

    /// Answer from the in-memory snapshot of the last notified range
    fn get_cached_changes(&self, channel: &str, options: &ChangesOptions) -> CachedChanges;

    /// Index one document mutation. Failures are logged, not returned.
    async fn doc_changed(&self, doc_id: &str, body: &[u8], vb_no: VbNo);

    async fn get_stable_sequence(&self, doc_id: &str) -> SequenceId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        IndexOptions::default().validate().unwrap();
        IndexOptions::for_testing().validate().unwrap();
    }

    #[test]
    fn test_options_validation() {
        let mut options = IndexOptions::for_testing();
        options.block_capacity = 0;
        assert!(options.validate().is_err());

        let mut options = IndexOptions::for_testing();
        options.block_capacity = 1 << 40;
        assert!(options.validate().is_err());
        options.block_capacity = MAX_BLOCK_CAPACITY;
        options.validate().unwrap();

        let mut options = IndexOptions::for_testing();
        options.num_partitions = 32;
        assert!(options.validate().is_err());

        let mut options = IndexOptions::for_testing();
        options.key_prefix.clear();
        assert!(options.validate().is_err());
    }
}
