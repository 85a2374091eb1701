//! Vbucket to partition assignment
//!
//! Every index writer must route a vbucket to the same partition, otherwise
//! two nodes would write the same sequence into different blocks. The map is
//! therefore published once to the bucket and adopted by every later node.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::index::keys::IndexKeys;
use crate::storage::{Bucket, Cas};
use crate::types::{PartitionId, VbNo};
use crate::{Error, Result};

/// Immutable vbucket -> partition lookup table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPartitionMap {
    /// Partition for each vbucket, indexed by vbucket number
    assignments: Vec<PartitionId>,
}

impl IndexPartitionMap {
    /// Assign contiguous vbucket ranges evenly across partitions
    pub fn uniform(num_vbuckets: u16, num_partitions: u16) -> Result<Self> {
        if num_vbuckets == 0 || num_partitions == 0 {
            return Err(Error::index(
                "partition map needs at least one vbucket and one partition",
            ));
        }
        if num_partitions > num_vbuckets {
            return Err(Error::index(format!(
                "cannot spread {} vbuckets over {} partitions",
                num_vbuckets, num_partitions
            )));
        }

        let assignments = (0..num_vbuckets as u32)
            .map(|vb| (vb * num_partitions as u32 / num_vbuckets as u32) as PartitionId)
            .collect();

        Ok(Self { assignments })
    }

    /// Build a map from explicit assignments (index = vbucket)
    pub fn from_assignments(assignments: Vec<PartitionId>) -> Result<Self> {
        if assignments.is_empty() {
            return Err(Error::index("partition map cannot be empty"));
        }
        if assignments.len() > VbNo::MAX as usize + 1 {
            return Err(Error::index("partition map has more entries than vbuckets"));
        }
        Ok(Self { assignments })
    }

    /// Partition for a vbucket
    pub fn partition(&self, vb_no: VbNo) -> Result<PartitionId> {
        self.assignments
            .get(vb_no as usize)
            .copied()
            .ok_or(Error::InvalidVbucket(vb_no))
    }

    pub fn num_vbuckets(&self) -> usize {
        self.assignments.len()
    }

    /// Distinct partition ids, ascending
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions = self.assignments.clone();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    /// Vbuckets routed to a partition
    pub fn vbuckets_for(&self, partition: PartitionId) -> Vec<VbNo> {
        self.assignments
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == partition)
            .map(|(vb, _)| vb as VbNo)
            .collect()
    }

    /// Publish `proposed` unless another node already published a map, in
    /// which case the published map wins.
    pub async fn load_or_publish(
        bucket: &dyn Bucket,
        keys: &IndexKeys,
        proposed: IndexPartitionMap,
    ) -> Result<Self> {
        let key = keys.partition_map_key();
        let data = Bytes::from(serde_json::to_vec(&proposed)?);

        match bucket.write_cas(&key, data, &Cas::none()).await {
            Ok(_) => {
                tracing::info!(
                    partitions = proposed.partitions().len(),
                    vbuckets = proposed.num_vbuckets(),
                    "Published partition map"
                );
                Ok(proposed)
            }
            Err(e) if e.is_cas_mismatch() => {
                let published: IndexPartitionMap = serde_json::from_slice(&bucket.get(&key).await?)?;
                if published != proposed {
                    tracing::info!(
                        partitions = published.partitions().len(),
                        vbuckets = published.num_vbuckets(),
                        "Adopting partition map published by another node"
                    );
                }
                Ok(published)
            }
            Err(e) => Err(e),
        }
    }
}

/// Vbucket a document key hashes to, using the bucket's CRC32 key hashing.
pub fn vbucket_for_key(key: &str, num_vbuckets: u16) -> VbNo {
    if num_vbuckets == 0 {
        return 0;
    }
    let hash = (crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff;
    (hash % num_vbuckets as u32) as VbNo
}
