//! Bounded LRU cache of index blocks
//!
//! Every cached block carries the stable sequence it was known to be
//! complete through. Readers only trust a block for sequences at or below
//! that point and reload it otherwise.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use super::block::IndexBlock;

/// A cached block and the highest sequence it is known to hold all entries for
#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub block: IndexBlock,
    pub complete_through: u64,
}

pub struct BlockCache {
    inner: Mutex<LruCache<String, CachedBlock>>,
}

impl BlockCache {
    pub fn new(max_blocks: usize) -> Self {
        let capacity = NonZeroUsize::new(max_blocks).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a copy of a cached block, marking it recently used
    pub fn get(&self, key: &str) -> Option<CachedBlock> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, block: IndexBlock, complete_through: u64) {
        self.inner.lock().put(
            key,
            CachedBlock {
                block,
                complete_through,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<CachedBlock> {
        self.inner.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every block for which `keep` returns false; returns the number dropped
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&CachedBlock) -> bool,
    {
        let mut inner = self.inner.lock();
        let evict: Vec<String> = inner
            .iter()
            .filter(|(_, cached)| !keep(cached))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &evict {
            inner.pop(key);
        }
        evict.len()
    }
}
