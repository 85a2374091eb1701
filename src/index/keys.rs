//! Bucket key generation for index documents

use crate::types::PartitionId;

/// Derives every bucket key the index reads or writes from one prefix.
#[derive(Debug, Clone)]
pub struct IndexKeys {
    prefix: String,
}

impl IndexKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key for a channel's change counter
    pub fn count_key(&self, channel: &str) -> String {
        format!("{}_count:{}", self.prefix, channel)
    }

    /// Key for an index block
    pub fn block_key(&self, channel: &str, partition: PartitionId, block_index: u64) -> String {
        format!("{}:{}:{}:block{}", self.prefix, channel, partition, block_index)
    }

    /// Key for a single sequence's log entry
    pub fn entry_key(&self, sequence: u64) -> String {
        format!("{}:seq:{}", self.prefix, sequence)
    }

    /// Key holding the published vbucket to partition assignment
    pub fn partition_map_key(&self) -> String {
        format!("{}:partition_map", self.prefix)
    }

    /// Key holding the stable sequence published by the sequence allocator
    pub fn stable_sequence_key(&self) -> String {
        format!("{}:stable_seq", self.prefix)
    }
}
