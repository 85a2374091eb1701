//! Bucket-backed change index
//!
//! Owns one [`KvChannelIndex`] per channel, created on first touch, and
//! turns document mutations into index entries for every channel the
//! document is in or was just removed from.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::block::IndexEntry;
use super::channel::KvChannelIndex;
use super::keys::IndexKeys;
use super::notify::ChangeNotifier;
use super::partition::IndexPartitionMap;
use super::stable::StableSequenceSource;
use super::{ChangeIndex, IndexContext, IndexOptions};
use crate::channels::{is_valid_channel_name, ChannelMapper, DocumentChange};
use crate::storage::Bucket;
use crate::types::{CachedChanges, ChangesOptions, LogEntry, SequenceId, VbNo};
use crate::{Error, Result};

/// A raw document mutation as delivered by the mutation feed
#[derive(Debug, Clone)]
pub struct Mutation {
    pub doc_id: String,
    pub body: Bytes,
    pub vb_no: VbNo,
}

impl Mutation {
    pub fn new(doc_id: impl Into<String>, body: impl Into<Bytes>, vb_no: VbNo) -> Self {
        Self {
            doc_id: doc_id.into(),
            body: body.into(),
            vb_no,
        }
    }
}

pub struct KvChangeIndex {
    bucket: Arc<dyn Bucket>,
    mapper: Arc<dyn ChannelMapper>,
    context: RwLock<Option<Arc<IndexContext>>>,
    channels: DashMap<String, Arc<KvChannelIndex>>,
    enabled: AtomicBool,
    /// Set by `stop`; no poll loop starts until the next `init`
    stopped: AtomicBool,
}

impl KvChangeIndex {
    pub fn new(bucket: Arc<dyn Bucket>, mapper: Arc<dyn ChannelMapper>) -> Self {
        Self {
            bucket,
            mapper,
            context: RwLock::new(None),
            channels: DashMap::new(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn context(&self) -> Option<Arc<IndexContext>> {
        self.context.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.context.read().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_indexing_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The partition map in effect, once initialized
    pub fn partition_map(&self) -> Option<Arc<IndexPartitionMap>> {
        self.context().map(|ctx| ctx.partition_map.clone())
    }

    /// Index for `name`, created (and its poller started) on first use
    pub fn channel_index(&self, name: &str) -> Result<Arc<KvChannelIndex>> {
        if !is_valid_channel_name(name) {
            return Err(Error::InvalidChannel(name.to_string()));
        }
        let ctx = self.context().ok_or(Error::NotInitialized)?;

        let index = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(channel = name, "Creating channel index");
                Arc::new(KvChannelIndex::new(name, ctx.clone()))
            })
            .clone();

        if ctx.options.poll_enabled && !self.is_stopped() {
            index.start_notify();
        }
        Ok(index)
    }

    /// Existing index for `name`, without creating one
    pub fn channel(&self, name: &str) -> Option<Arc<KvChannelIndex>> {
        self.channels.get(name).map(|entry| entry.value().clone())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Persist the log entry for a change. Must happen before any block
    /// marks the sequence, since readers resolve markers through it.
    async fn write_log_entry(ctx: &IndexContext, entry: &LogEntry) -> Result<()> {
        let data = Bytes::from(serde_json::to_vec(entry)?);
        ctx.bucket
            .set(&ctx.keys.entry_key(entry.sequence), data)
            .await?;
        Ok(())
    }

    /// Validate a resolved change and record its log entry. Returns false
    /// when the change has nothing to index.
    async fn record_change(
        ctx: &IndexContext,
        doc_id: &str,
        change: &DocumentChange,
        vb_no: VbNo,
    ) -> Result<bool> {
        if change.sequence == 0 {
            tracing::debug!(doc_id, "Skipping change without a sequence");
            return Ok(false);
        }
        ctx.partition_map.partition(vb_no)?;
        Self::write_log_entry(ctx, &change.log_entry(doc_id)).await?;
        Ok(true)
    }

    async fn index_change(
        &self,
        ctx: &IndexContext,
        doc_id: &str,
        change: &DocumentChange,
        vb_no: VbNo,
    ) -> Result<()> {
        if !Self::record_change(ctx, doc_id, change, vb_no).await? {
            return Ok(());
        }

        for (channel, removal) in change.targets(ctx.options.index_star_channel) {
            let index = match self.channel_index(&channel) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!(doc_id, channel = %channel, error = %e, "Skipping channel");
                    continue;
                }
            };
            let entry = IndexEntry::new(vb_no, change.sequence, removal);
            if let Err(e) = index.add(entry).await {
                tracing::error!(
                    doc_id,
                    channel = %channel,
                    sequence = change.sequence,
                    error = %e,
                    "Failed to index change"
                );
            }
        }
        Ok(())
    }

    /// Batch ingestion: one grouped write per channel and block.
    ///
    /// Mutations that cannot be resolved are logged and skipped. The first
    /// channel write failure is returned after all channels were attempted.
    pub async fn docs_changed(&self, mutations: Vec<Mutation>) -> Result<()> {
        if !self.is_indexing_enabled() {
            return Ok(());
        }
        let ctx = self.context().ok_or(Error::NotInitialized)?;

        let mut by_channel: BTreeMap<String, Vec<IndexEntry>> = BTreeMap::new();
        for mutation in &mutations {
            let change = match self.mapper.resolve(&mutation.doc_id, &mutation.body) {
                Ok(change) => change,
                Err(e) => {
                    tracing::warn!(doc_id = %mutation.doc_id, error = %e, "Skipping unresolvable mutation");
                    continue;
                }
            };
            match Self::record_change(&ctx, &mutation.doc_id, &change, mutation.vb_no).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(doc_id = %mutation.doc_id, error = %e, "Skipping mutation");
                    continue;
                }
            }
            for (channel, removal) in change.targets(ctx.options.index_star_channel) {
                by_channel
                    .entry(channel)
                    .or_default()
                    .push(IndexEntry::new(mutation.vb_no, change.sequence, removal));
            }
        }

        let mut first_error = None;
        for (channel, entries) in by_channel {
            let result = match self.channel_index(&channel) {
                Ok(index) => index.add_set(&entries).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(channel = %channel, entries = entries.len(), error = %e, "Failed to index batch");
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!(mutations = mutations.len(), "Indexed mutation batch");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Evict cached blocks below each channel's last published range
    pub fn compact(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().compact())
            .sum()
    }
}

#[async_trait]
impl ChangeIndex for KvChangeIndex {
    async fn init(
        &self,
        last_sequence: u64,
        stable_source: Arc<dyn StableSequenceSource>,
        notifier: ChangeNotifier,
        options: IndexOptions,
    ) -> Result<()> {
        options.validate()?;
        // the read bound must not regress across a re-init
        let last_stable = self
            .context()
            .map(|ctx| ctx.stable_sequence())
            .unwrap_or(0);
        if self.is_initialized() {
            self.clear();
        }

        let keys = IndexKeys::new(options.key_prefix.clone());
        let proposed = IndexPartitionMap::uniform(options.num_vbuckets, options.num_partitions)?;
        let partition_map =
            IndexPartitionMap::load_or_publish(self.bucket.as_ref(), &keys, proposed).await?;

        tracing::info!(
            key_prefix = %options.key_prefix,
            block_capacity = options.block_capacity,
            partitions = partition_map.partitions().len(),
            last_sequence,
            "Change index initialized"
        );

        *self.context.write() = Some(Arc::new(IndexContext {
            bucket: self.bucket.clone(),
            keys,
            partition_map: Arc::new(partition_map),
            stable_source,
            notifier,
            options,
            start_sequence: last_sequence,
            stable_sequence: AtomicU64::new(last_stable),
        }));
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for entry in self.channels.iter() {
            entry.value().stop();
        }
    }

    fn clear(&self) {
        self.stop();
        self.channels.clear();
    }

    fn enable_channel_indexing(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "Channel indexing toggled");
    }

    async fn get_changes(&self, channel: &str, options: &ChangesOptions) -> Result<Vec<LogEntry>> {
        self.channel_index(channel)?.get_changes(options).await
    }

    fn get_cached_changes(&self, channel: &str, options: &ChangesOptions) -> CachedChanges {
        match self.channel(channel) {
            Some(index) => index.get_cached_changes(options),
            None => CachedChanges {
                valid_from: self.context().map_or(0, |ctx| ctx.stable_sequence()) + 1,
                entries: Vec::new(),
            },
        }
    }

    async fn doc_changed(&self, doc_id: &str, body: &[u8], vb_no: VbNo) {
        if !self.is_indexing_enabled() {
            return;
        }
        let Some(ctx) = self.context() else {
            tracing::warn!(doc_id, "Change index not initialized, dropping mutation");
            return;
        };

        let change = match self.mapper.resolve(doc_id, body) {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(doc_id, error = %e, "Unable to resolve channels");
                return;
            }
        };

        if let Err(e) = self.index_change(&ctx, doc_id, &change, vb_no).await {
            tracing::warn!(doc_id, vb_no, error = %e, "Failed to index document change");
        }
    }

    async fn get_stable_sequence(&self, doc_id: &str) -> SequenceId {
        let Some(ctx) = self.context() else {
            return SequenceId::new(0);
        };

        match ctx.stable_source.stable_sequence().await {
            Ok(stable) => SequenceId::new(ctx.raise_stable_sequence(stable)),
            Err(e) => {
                tracing::warn!(doc_id, error = %e, "Stable sequence unavailable, using last observed value");
                SequenceId::new(ctx.stable_sequence())
            }
        }
    }
}

impl Drop for KvChangeIndex {
    fn drop(&mut self) {
        self.stop();
    }
}
