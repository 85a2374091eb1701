//! Per-channel index engine
//!
//! Writes go straight to the bucket through CAS on the target block. Reads
//! walk blocks from every partition and are clamped to the stable sequence,
//! which never moves backwards. A background poller watches the channel's
//! change counter and publishes newly visible ranges to the notifier.

use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::block::{block_index_for, BlockId, EntryState, IndexBlock, IndexEntry};
use super::cache::BlockCache;
use super::IndexContext;
use crate::storage::parse_counter;
use crate::types::{CachedChanges, ChangesOptions, ChannelSet, LogEntry, PartitionId};
use crate::{Error, Result};

/// Poller bookkeeping, guarded by the notify lock
#[derive(Debug, Default)]
struct NotifyState {
    /// Highest sequence already published to listeners
    last_sequence: u64,
    /// Counter value the last publication accounted for
    last_counter: u64,
    /// Counted writes may still sit above the stable sequence
    pending: bool,
}

/// The last range published to listeners: `(since, through]`
#[derive(Debug)]
struct RecentChanges {
    since: u64,
    through: u64,
    entries: Vec<LogEntry>,
}

/// Result of a range read. `through` is the highest sequence the read fully
/// covered; it is below the requested bound when a block could not be read.
#[derive(Debug)]
struct RangeRead {
    entries: Vec<LogEntry>,
    through: u64,
}

pub struct KvChannelIndex {
    channel: String,
    ctx: Arc<IndexContext>,

    /// Stable value the poller last acted on
    polled_stable: AtomicU64,

    block_cache: BlockCache,
    notify: Mutex<NotifyState>,
    recent: RwLock<Option<Arc<RecentChanges>>>,

    poller: SyncMutex<Option<JoinHandle<()>>>,
    poll_starts: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl KvChannelIndex {
    pub fn new(channel: impl Into<String>, ctx: Arc<IndexContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            block_cache: BlockCache::new(ctx.options.cache_max_blocks),
            notify: Mutex::new(NotifyState {
                last_sequence: ctx.start_sequence,
                ..Default::default()
            }),
            ctx,
            polled_stable: AtomicU64::new(0),
            recent: RwLock::new(None),
            poller: SyncMutex::new(None),
            poll_starts: AtomicUsize::new(0),
            shutdown,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    // ---- write path ----

    /// Index a single entry
    pub async fn add(&self, entry: IndexEntry) -> Result<()> {
        let partition = self.ctx.partition_map.partition(entry.vb_no)?;
        let id = BlockId::for_sequence(partition, entry.sequence, self.ctx.options.block_capacity);
        self.cas_update(id, &[entry]).await
    }

    /// Index a batch with one CAS write per distinct block.
    ///
    /// Every block is attempted; the first failure is returned afterwards.
    pub async fn add_set(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut by_partition: BTreeMap<PartitionId, Vec<IndexEntry>> = BTreeMap::new();
        for entry in entries {
            let partition = self.ctx.partition_map.partition(entry.vb_no)?;
            by_partition.entry(partition).or_default().push(*entry);
        }

        let mut first_error = None;
        for (partition, entries) in by_partition {
            if let Err(e) = self.add_partition_set(partition, &entries).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Index a batch that all routes to one partition
    pub async fn add_partition_set(
        &self,
        partition: PartitionId,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let capacity = self.ctx.options.block_capacity;
        let mut by_block: BTreeMap<BlockId, Vec<IndexEntry>> = BTreeMap::new();
        for entry in entries {
            by_block
                .entry(BlockId::for_sequence(partition, entry.sequence, capacity))
                .or_default()
                .push(*entry);
        }

        let mut first_error = None;
        for (id, entries) in by_block {
            if let Err(e) = self.cas_update(id, &entries).await {
                tracing::warn!(
                    channel = %self.channel,
                    partition = id.partition,
                    block = id.block_index,
                    error = %e,
                    "Failed to update index block"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Apply `entries` to a block and write it back with CAS, reloading and
    /// re-applying on every lost race.
    async fn cas_update(&self, id: BlockId, entries: &[IndexEntry]) -> Result<()> {
        let key = self.block_key(id);
        let complete_through = self.ctx.stable_sequence();

        let mut block = match self.block_cache.get(&key) {
            Some(cached) => cached.block,
            None => match self.load_block(&key, id).await {
                Ok(Some(block)) => block,
                Ok(None) => self.empty_block(id),
                Err(e @ Error::Decode(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Block read failed, starting from empty block");
                    self.empty_block(id)
                }
            },
        };

        let max_attempts = self.ctx.options.max_cas_retries.max(1);
        let mut attempt = 0u32;

        loop {
            block.apply(entries)?;

            let written = self
                .ctx
                .bucket
                .write_cas(&key, block.encode(), block.cas())
                .await;
            let error = match written {
                Ok(cas) => {
                    block.set_cas(cas);
                    self.block_cache.put(key.clone(), block, complete_through);
                    self.increment_counter().await;
                    tracing::debug!(
                        channel = %self.channel,
                        key = %key,
                        entries = entries.len(),
                        attempts = attempt + 1,
                        "Index block written"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if !(error.is_cas_mismatch() || matches!(error, Error::Storage(_))) {
                return Err(error);
            }

            attempt += 1;
            if attempt >= max_attempts {
                self.block_cache.remove(&key);
                tracing::warn!(key = %key, attempts = attempt, error = %error, "Giving up on index block update");
                return Err(Error::CasRetriesExhausted {
                    key,
                    attempts: attempt,
                });
            }
            tracing::debug!(key = %key, attempt, error = %error, "Index block write lost, retrying");

            let delay = self.backoff(attempt);
            if !delay.is_zero() {
                time::sleep(delay).await;
            }

            block = match self.load_block(&key, id).await {
                Ok(Some(block)) => block,
                Ok(None) => self.empty_block(id),
                Err(e @ Error::Decode(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Block reload failed, retrying with current copy");
                    block
                }
            };
        }
    }

    /// Exponential backoff capped at `cas_backoff_max`, jittered into the upper half
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.ctx.options.cas_backoff_base;
        if base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = base
            .saturating_mul(1u32 << exponent)
            .min(self.ctx.options.cas_backoff_max);
        let half = delay / 2;
        half + half.mul_f64(fastrand::f64())
    }

    async fn increment_counter(&self) {
        let key = self.ctx.keys.count_key(&self.channel);
        if let Err(e) = self.ctx.bucket.incr(&key, 1, 1).await {
            // the block write stands; listeners catch up on the next counted write
            tracing::warn!(channel = %self.channel, error = %e, "Failed to increment index counter");
        }
    }

    fn block_key(&self, id: BlockId) -> String {
        self.ctx
            .keys
            .block_key(&self.channel, id.partition, id.block_index)
    }

    fn empty_block(&self, id: BlockId) -> IndexBlock {
        IndexBlock::new(self.channel.clone(), id, self.ctx.options.block_capacity)
    }

    async fn load_block(&self, key: &str, id: BlockId) -> Result<Option<IndexBlock>> {
        match self.ctx.bucket.get_raw(key).await {
            Ok((data, cas)) => IndexBlock::decode(
                &self.channel,
                id,
                self.ctx.options.block_capacity,
                &data,
                cas,
            )
            .map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ---- read path ----

    /// Read a block, serving it from cache when the cached copy is known to
    /// be complete through `stable`.
    async fn read_block(&self, id: BlockId, stable: u64) -> Result<IndexBlock> {
        let key = self.block_key(id);
        let needed_through = (id.block_index + 1)
            .saturating_mul(self.ctx.options.block_capacity)
            .saturating_sub(1)
            .min(stable);

        if let Some(cached) = self.block_cache.get(&key) {
            if cached.complete_through >= needed_through {
                return Ok(cached.block);
            }
        }

        let block = self
            .load_block(&key, id)
            .await?
            .unwrap_or_else(|| self.empty_block(id));
        self.block_cache.put(key, block.clone(), stable);
        Ok(block)
    }

    async fn read_entry(&self, sequence: u64) -> Result<LogEntry> {
        let data = self.ctx.bucket.get(&self.ctx.keys.entry_key(sequence)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Entries in `(since, stable]`, deduplicated by document
    async fn changes_since(&self, since: u64, stable: u64) -> RangeRead {
        if stable <= since {
            return RangeRead {
                entries: Vec::new(),
                through: since,
            };
        }

        let capacity = self.ctx.options.block_capacity;
        let partitions = self.ctx.partition_map.partitions();
        let first = block_index_for(since + 1, capacity);
        let last = block_index_for(stable, capacity);

        let mut entries = Vec::new();
        let mut through = stable;

        'blocks: for block_index in first..=last {
            let mut markers: Vec<(u64, EntryState)> = Vec::new();
            for &partition in &partitions {
                match self.read_block(BlockId::new(partition, block_index), stable).await {
                    Ok(block) => markers.extend(block.entries(since + 1, stable)),
                    Err(e) => {
                        tracing::warn!(
                            channel = %self.channel,
                            partition,
                            block = block_index,
                            error = %e,
                            "Block read failed, returning partial range"
                        );
                        through = block_index.saturating_mul(capacity).saturating_sub(1).max(since);
                        break 'blocks;
                    }
                }
            }

            markers.sort_unstable_by_key(|(sequence, _)| *sequence);

            let mut block_entries = Vec::with_capacity(markers.len());
            for (sequence, state) in markers {
                match self.read_entry(sequence).await {
                    Ok(mut entry) => {
                        if state == EntryState::Removed {
                            entry.set_removed();
                        }
                        block_entries.push(entry);
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = %self.channel,
                            sequence,
                            error = %e,
                            "Log entry fetch failed, returning partial range"
                        );
                        through = block_index.saturating_mul(capacity).saturating_sub(1).max(since);
                        break 'blocks;
                    }
                }
            }
            entries.extend(block_entries);
        }

        RangeRead {
            entries: dedup_by_doc_id(entries),
            through,
        }
    }

    // ---- queries ----

    /// Current stable sequence from the source, never lower than before
    pub async fn refresh_stable_sequence(&self) -> u64 {
        match self.ctx.stable_source.stable_sequence().await {
            Ok(stable) => self.ctx.raise_stable_sequence(stable),
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Stable sequence unavailable");
                self.ctx.stable_sequence()
            }
        }
    }

    pub fn stable_sequence(&self) -> u64 {
        self.ctx.stable_sequence()
    }

    pub async fn get_changes(&self, options: &ChangesOptions) -> Result<Vec<LogEntry>> {
        let stable = self.refresh_stable_sequence().await;
        let read = self.changes_since(options.since.safe_sequence(), stable).await;
        Ok(apply_options(read.entries, options))
    }

    /// Entries from the last published range newer than `options.since`
    pub fn get_cached_changes(&self, options: &ChangesOptions) -> CachedChanges {
        let recent = self.recent.read().clone();
        match recent {
            Some(recent) => {
                let since = options.since.safe_sequence();
                let entries = recent
                    .entries
                    .iter()
                    .filter(|entry| entry.sequence > since)
                    .cloned()
                    .collect();
                CachedChanges {
                    valid_from: recent.since + 1,
                    entries: apply_options(entries, options),
                }
            }
            None => CachedChanges {
                valid_from: self.stable_sequence() + 1,
                entries: Vec::new(),
            },
        }
    }

    // ---- poll / notify path ----

    /// Read the channel's change counter; a missing counter reads as 0
    pub async fn index_counter(&self) -> Result<u64> {
        let key = self.ctx.keys.count_key(&self.channel);
        match self.ctx.bucket.get(&key).await {
            Ok(data) => parse_counter(&key, &data),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// One poll cycle. Returns true when listeners were notified.
    pub async fn poll_for_changes(&self) -> bool {
        let stable = match self.ctx.stable_source.stable_sequence().await {
            Ok(stable) => stable,
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Stable sequence unavailable, skipping poll");
                0
            }
        };

        if stable <= self.polled_stable.load(Ordering::Acquire) {
            return false;
        }
        self.polled_stable.fetch_max(stable, Ordering::AcqRel);
        self.ctx.raise_stable_sequence(stable);

        let counter = match self.index_counter().await {
            Ok(counter) => counter,
            Err(e) => {
                tracing::warn!(channel = %self.channel, error = %e, "Index counter unavailable, skipping poll");
                return false;
            }
        };

        let (last_counter, pending) = {
            let state = self.notify.lock().await;
            (state.last_counter, state.pending)
        };

        if counter > last_counter {
            self.update_recent_cache(counter).await
        } else if pending {
            self.recheck_pending().await
        } else {
            false
        }
    }

    /// Publish everything that became visible since the last notification,
    /// provided `counter` is still ahead once the notify lock is held.
    pub async fn update_recent_cache(&self, counter: u64) -> bool {
        {
            let mut state = self.notify.lock().await;
            if counter <= state.last_counter {
                return false;
            }

            let stable = self.stable_sequence();
            let since = state.last_sequence;
            let read = self.changes_since(since, stable).await;
            if read.entries.is_empty() {
                tracing::warn!(
                    channel = %self.channel,
                    counter,
                    since,
                    stable,
                    "Index counter advanced but no new entries are visible yet"
                );
                return false;
            }

            state.last_counter = counter;
            state.pending = true;
            self.publish(&mut state, since, read);
        }

        self.notify_listeners().await;
        true
    }

    /// Re-read after a stable advance that the counter did not reflect
    async fn recheck_pending(&self) -> bool {
        {
            let mut state = self.notify.lock().await;
            if !state.pending {
                return false;
            }

            let stable = self.stable_sequence();
            let since = state.last_sequence;
            let read = self.changes_since(since, stable).await;
            if read.entries.is_empty() {
                if read.through >= stable {
                    state.pending = false;
                    state.last_sequence = state.last_sequence.max(read.through);
                }
                return false;
            }

            self.publish(&mut state, since, read);
        }

        self.notify_listeners().await;
        true
    }

    fn publish(&self, state: &mut NotifyState, since: u64, read: RangeRead) {
        let through = read.through.max(since);
        tracing::debug!(
            channel = %self.channel,
            since,
            through,
            entries = read.entries.len(),
            "Publishing recent changes"
        );
        state.last_sequence = through;
        *self.recent.write() = Some(Arc::new(RecentChanges {
            since,
            through,
            entries: read.entries,
        }));
    }

    async fn notify_listeners(&self) {
        self.ctx
            .notifier
            .notify(ChannelSet::from([self.channel.clone()]))
            .await;
    }

    /// Start the background poller. Only the first call starts one; later
    /// calls and calls after `stop` return false.
    pub fn start_notify(self: &Arc<Self>) -> bool {
        let mut poller = self.poller.lock();
        if poller.is_some() || *self.shutdown.borrow() {
            return false;
        }

        self.poll_starts.fetch_add(1, Ordering::AcqRel);
        let index = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *poller = Some(tokio::spawn(async move {
            index.run_poll_loop(shutdown).await;
        }));

        tracing::info!(channel = %self.channel, "Started change polling");
        true
    }

    async fn run_poll_loop(&self, mut shutdown: watch::Receiver<bool>) {
        self.prime_notify_state().await;

        let period = self.ctx.options.poll_interval.max(Duration::from_millis(1));
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            self.poll_for_changes().await;
        }

        tracing::info!(channel = %self.channel, "Stopped change polling");
    }

    /// Changes at or below the stable sequence when polling starts are
    /// served by `get_changes`; only later ones are announced.
    async fn prime_notify_state(&self) {
        let stable = self.refresh_stable_sequence().await;
        self.polled_stable.fetch_max(stable, Ordering::AcqRel);

        let mut state = self.notify.lock().await;
        state.last_sequence = state.last_sequence.max(stable);
    }

    /// Signal the poller to exit at its next wake
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.poller.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of poll loops ever started for this index
    pub fn poll_starts(&self) -> usize {
        self.poll_starts.load(Ordering::Acquire)
    }

    pub async fn last_counter(&self) -> u64 {
        self.notify.lock().await.last_counter
    }

    pub async fn last_sequence(&self) -> u64 {
        self.notify.lock().await.last_sequence
    }

    pub fn cached_blocks(&self) -> usize {
        self.block_cache.len()
    }

    /// Evict cached blocks that lie wholly below the last published range
    pub fn compact(&self) -> usize {
        let recent = self.recent.read().clone();
        let Some(recent) = recent else {
            return 0;
        };
        let floor = recent.since + 1;
        let evicted = self
            .block_cache
            .retain(|cached| cached.block.end_sequence() > floor);
        if evicted > 0 {
            tracing::debug!(channel = %self.channel, evicted, through = recent.through, "Evicted cached blocks");
        }
        evicted
    }
}

fn apply_options(mut entries: Vec<LogEntry>, options: &ChangesOptions) -> Vec<LogEntry> {
    if options.active_only {
        entries.retain(|entry| !entry.is_removed() && !entry.is_deleted());
    }
    if options.limit > 0 {
        entries.truncate(options.limit);
    }
    entries
}

/// Keep only the newest entry per document, oldest survivor first
pub(crate) fn dedup_by_doc_id(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut deduped: Vec<LogEntry> = entries
        .into_iter()
        .rev()
        .filter(|entry| seen.insert(entry.doc_id.clone()))
        .collect();
    deduped.reverse();
    deduped
}
