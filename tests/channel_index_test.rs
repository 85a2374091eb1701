//! Channel index behaviour against an in-memory bucket

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chanidx::channels::SyncMetadataMapper;
use chanidx::index::{
    ChangeIndex, ChangeNotifier, ChangeReceiver, IndexEntry, IndexOptions, KvChangeIndex,
    Mutation,
};
use chanidx::storage::memory::MemoryBucket;
use chanidx::storage::Bucket;
use chanidx::types::ChangesOptions;
use chanidx::{Error, Result};
use serde_json::json;

struct Harness {
    bucket: Arc<MemoryBucket>,
    index: KvChangeIndex,
    stable: Arc<AtomicU64>,
    stable_failing: Arc<AtomicBool>,
    changes: ChangeReceiver,
}

impl Harness {
    async fn new(options: IndexOptions) -> Self {
        let bucket = Arc::new(MemoryBucket::new());
        let stable = Arc::new(AtomicU64::new(0));
        let stable_failing = Arc::new(AtomicBool::new(false));

        let source = {
            let stable = stable.clone();
            let failing = stable_failing.clone();
            move || -> Result<u64> {
                if failing.load(Ordering::SeqCst) {
                    Err(Error::storage("stable sequence unavailable"))
                } else {
                    Ok(stable.load(Ordering::SeqCst))
                }
            }
        };

        let (notifier, changes) = ChangeNotifier::channel(64);
        let index = KvChangeIndex::new(bucket.clone(), Arc::new(SyncMetadataMapper));
        index
            .init(0, Arc::new(source), notifier, options)
            .await
            .unwrap();

        Self {
            bucket,
            index,
            stable,
            stable_failing,
            changes,
        }
    }

    fn set_stable(&self, stable: u64) {
        self.stable.store(stable, Ordering::SeqCst);
    }

    async fn write(&self, doc_id: &str, sequence: u64, channels: &[&str]) {
        let channels: serde_json::Map<String, serde_json::Value> = channels
            .iter()
            .map(|c| (c.to_string(), serde_json::Value::Null))
            .collect();
        let body = json!({
            "_sync": {"rev": format!("{}-a", sequence), "sequence": sequence, "channels": channels}
        });
        self.index
            .doc_changed(doc_id, body.to_string().as_bytes(), 0)
            .await;
    }

    async fn changes(&self, channel: &str, options: ChangesOptions) -> Vec<u64> {
        self.index
            .get_changes(channel, &options)
            .await
            .unwrap()
            .iter()
            .map(|entry| entry.sequence)
            .collect()
    }

    fn drain_notifications(&mut self) -> Vec<String> {
        let mut channels = Vec::new();
        while let Ok(set) = self.changes.try_recv() {
            channels.extend(set);
        }
        channels
    }
}

#[tokio::test]
async fn test_entries_span_blocks() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 1, &["ABC"]).await;
    h.write("doc2", 50, &["ABC"]).await;
    h.write("doc3", 150, &["ABC"]).await;
    h.set_stable(200);

    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![1, 50, 150]);
    assert_eq!(h.changes("ABC", ChangesOptions::since(50)).await, vec![150]);

    assert!(h.bucket.contains("_idx:ABC:0:block0"));
    assert!(h.bucket.contains("_idx:ABC:0:block1"));
    assert_eq!(h.bucket.get("_idx_count:ABC").await.unwrap(), "3");

    // every document also lands in the star channel
    assert_eq!(h.changes("*", ChangesOptions::since(0)).await, vec![1, 50, 150]);
}

#[tokio::test]
async fn test_newest_revision_wins() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 5, &["ABC"]).await;
    h.write("doc2", 7, &["ABC"]).await;
    h.write("doc1", 9, &["ABC"]).await;
    h.set_stable(20);

    let entries = h
        .index
        .get_changes("ABC", &ChangesOptions::since(0))
        .await
        .unwrap();
    let docs: Vec<(&str, u64)> = entries
        .iter()
        .map(|e| (e.doc_id.as_str(), e.sequence))
        .collect();
    assert_eq!(docs, vec![("doc2", 7), ("doc1", 9)]);
}

#[tokio::test]
async fn test_reads_are_clamped_to_stable_sequence() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 10, &["ABC"]).await;
    h.write("doc2", 150, &["ABC"]).await;

    h.set_stable(100);
    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![10]);

    h.set_stable(200);
    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![10, 150]);

    // a lower value from the source is ignored
    h.set_stable(50);
    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![10, 150]);
    assert_eq!(h.index.channel("ABC").unwrap().stable_sequence(), 200);
    assert_eq!(h.index.get_stable_sequence("doc1").await.seq, 200);
}

#[tokio::test]
async fn test_stable_source_errors_fall_back() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 10, &["ABC"]).await;
    h.set_stable(20);
    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![10]);
    assert_eq!(h.index.get_stable_sequence("doc1").await.seq, 20);

    h.stable_failing.store(true, Ordering::SeqCst);
    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![10]);
    assert_eq!(h.index.get_stable_sequence("doc1").await.seq, 20);
}

#[tokio::test]
async fn test_removal_and_query_options() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 1, &["ABC", "NBC"]).await;
    h.write("doc2", 2, &["ABC"]).await;
    h.write("doc3", 3, &["ABC"]).await;

    // doc1 leaves NBC at sequence 4
    let body = json!({
        "_sync": {
            "rev": "2-b",
            "sequence": 4,
            "channels": {"ABC": null, "NBC": {"seq": 4, "rev": "2-b"}}
        }
    });
    h.index
        .doc_changed("doc1", body.to_string().as_bytes(), 0)
        .await;
    h.set_stable(10);

    let nbc = h
        .index
        .get_changes("NBC", &ChangesOptions::since(0))
        .await
        .unwrap();
    assert_eq!(nbc.len(), 1);
    assert_eq!(nbc[0].sequence, 4);
    assert!(nbc[0].is_removed());

    assert!(h
        .index
        .get_changes("NBC", &ChangesOptions::since(0).with_active_only(true))
        .await
        .unwrap()
        .is_empty());

    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![2, 3, 4]);
    assert_eq!(
        h.changes("ABC", ChangesOptions::since(0).with_limit(2)).await,
        vec![2, 3]
    );
}

#[tokio::test]
async fn test_batch_ingestion() {
    let h = Harness::new(IndexOptions::for_testing()).await;

    let mutations = (1..=5u64)
        .map(|seq| {
            let body = json!({"_sync": {"rev": "1-a", "sequence": seq, "channels": {"ABC": null}}});
            Mutation::new(format!("doc{}", seq), body.to_string(), (seq % 16) as u16)
        })
        .chain(std::iter::once(Mutation::new("broken", "not json", 0)))
        .collect();

    h.index.docs_changed(mutations).await.unwrap();
    h.set_stable(10);

    assert_eq!(h.changes("ABC", ChangesOptions::since(0)).await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_poll_notifies_once_per_advance() {
    let mut h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 5, &["ABC"]).await;
    let index = h.index.channel("ABC").unwrap();

    h.set_stable(10);
    assert!(index.poll_for_changes().await);
    assert_eq!(h.drain_notifications(), vec!["ABC".to_string()]);
    assert_eq!(index.last_counter().await, 1);

    // no stable advance, nothing to do
    assert!(!index.poll_for_changes().await);
    assert!(h.drain_notifications().is_empty());

    let cached = index.get_cached_changes(&ChangesOptions::since(0));
    assert_eq!(cached.valid_from, 1);
    assert_eq!(cached.entries.len(), 1);
    assert_eq!(cached.entries[0].doc_id, "doc1");
}

#[tokio::test]
async fn test_poll_skips_cycle_when_stable_source_fails() {
    let mut h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 5, &["ABC"]).await;
    let index = h.index.channel("ABC").unwrap();

    h.set_stable(10);
    h.stable_failing.store(true, Ordering::SeqCst);
    assert!(!index.poll_for_changes().await);
    assert!(h.drain_notifications().is_empty());

    h.stable_failing.store(false, Ordering::SeqCst);
    assert!(index.poll_for_changes().await);
    assert_eq!(h.drain_notifications(), vec!["ABC".to_string()]);
}

#[tokio::test]
async fn test_counted_write_above_stable_is_announced_later() {
    let mut h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 5, &["ABC"]).await;
    h.write("doc2", 15, &["ABC"]).await;
    let index = h.index.channel("ABC").unwrap();

    // both writes are counted, only the first is visible
    h.set_stable(10);
    assert!(index.poll_for_changes().await);
    assert_eq!(
        index.get_cached_changes(&ChangesOptions::since(0)).entries.len(),
        1
    );
    h.drain_notifications();

    // counter unchanged, but the stable advance exposes doc2
    h.set_stable(20);
    assert!(index.poll_for_changes().await);
    assert_eq!(h.drain_notifications(), vec!["ABC".to_string()]);
    let cached = index.get_cached_changes(&ChangesOptions::since(10));
    assert_eq!(cached.valid_from, 11);
    assert_eq!(cached.entries.len(), 1);
    assert_eq!(cached.entries[0].sequence, 15);

    // nothing left pending
    h.set_stable(30);
    assert!(!index.poll_for_changes().await);
    h.set_stable(40);
    assert!(!index.poll_for_changes().await);
}

#[tokio::test]
async fn test_update_recent_cache_runs_once_per_counter() {
    let mut h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 5, &["ABC"]).await;
    h.set_stable(10);

    let index = h.index.channel("ABC").unwrap();
    index.refresh_stable_sequence().await;
    let counter = index.index_counter().await.unwrap();
    assert_eq!(counter, 1);

    let (first, second) = tokio::join!(
        index.update_recent_cache(counter),
        index.update_recent_cache(counter)
    );
    assert!(first ^ second);
    assert_eq!(h.drain_notifications().len(), 1);
    assert_eq!(index.last_sequence().await, 10);
}

#[tokio::test]
async fn test_update_with_nothing_visible_is_retried() {
    let mut h = Harness::new(IndexOptions::for_testing()).await;
    h.write("doc1", 50, &["ABC"]).await;
    h.set_stable(10);

    let index = h.index.channel("ABC").unwrap();
    index.refresh_stable_sequence().await;
    assert!(!index.update_recent_cache(1).await);
    assert_eq!(index.last_counter().await, 0);

    h.set_stable(60);
    assert!(index.poll_for_changes().await);
    assert_eq!(h.drain_notifications(), vec!["ABC".to_string()]);
}

#[tokio::test]
async fn test_concurrent_start_notify_starts_one_poller() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    let index = h.index.channel_index("ABC").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let index = index.clone();
            tokio::spawn(async move { index.start_notify() })
        })
        .collect();

    let mut started = 0;
    for result in futures::future::join_all(handles).await {
        if result.unwrap() {
            started += 1;
        }
    }
    assert_eq!(started, 1);
    assert_eq!(index.poll_starts(), 1);
    assert!(index.is_polling());

    h.index.stop();
    tokio::time::timeout(Duration::from_secs(2), async {
        while index.is_polling() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("poller should exit after stop");
    assert!(!index.start_notify());
}

#[tokio::test]
async fn test_background_poller_notifies() {
    let mut options = IndexOptions::for_testing();
    options.poll_enabled = true;
    options.index_star_channel = false;
    let mut h = Harness::new(options).await;
    h.set_stable(10);

    let index = h.index.channel_index("ABC").unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while index.last_sequence().await < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("poller should prime from the stable sequence");

    h.write("doc1", 15, &["ABC"]).await;
    h.set_stable(20);

    let notified = tokio::time::timeout(Duration::from_secs(2), h.changes.recv())
        .await
        .expect("expected a change notification")
        .unwrap();
    assert!(notified.contains("ABC"));

    let cached = h
        .index
        .get_cached_changes("ABC", &ChangesOptions::since(10));
    assert_eq!(cached.valid_from, 11);
    assert_eq!(cached.entries.len(), 1);

    h.index.stop();
}

#[tokio::test]
async fn test_compact_evicts_blocks_below_published_range() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    for (doc, seq) in [("doc1", 5), ("doc2", 150), ("doc3", 250)] {
        h.write(doc, seq, &["ABC"]).await;
    }
    let index = h.index.channel("ABC").unwrap();

    h.set_stable(300);
    assert!(index.poll_for_changes().await);
    assert_eq!(index.compact(), 0);

    h.write("doc4", 350, &["ABC"]).await;
    h.set_stable(400);
    assert!(index.poll_for_changes().await);

    // blocks 0..=2 of all four partitions lie below sequence 301
    assert_eq!(index.compact(), 12);
    assert_eq!(index.cached_blocks(), 8);
    assert_eq!(
        h.changes("ABC", ChangesOptions::since(0)).await,
        vec![5, 150, 250, 350]
    );
}

#[tokio::test]
async fn test_cas_retries_are_bounded() {
    let mut options = IndexOptions::for_testing();
    options.max_cas_retries = 3;
    let h = Harness::new(options).await;
    let index = h.index.channel_index("ABC").unwrap();

    h.bucket.fail_next_writes(3);
    let err = index.add(IndexEntry::new(0, 5, false)).await.unwrap_err();
    assert!(matches!(err, Error::CasRetriesExhausted { attempts: 3, .. }));

    h.bucket.fail_next_writes(2);
    index.add(IndexEntry::new(0, 5, false)).await.unwrap();
    assert!(h.bucket.contains("_idx:ABC:0:block0"));
}

#[tokio::test]
async fn test_invalid_vbucket_in_batch_writes_nothing() {
    let h = Harness::new(IndexOptions::for_testing()).await;
    let index = h.index.channel_index("ABC").unwrap();

    let result = index
        .add_set(&[IndexEntry::new(0, 5, false), IndexEntry::new(99, 6, false)])
        .await;
    assert!(matches!(result, Err(Error::InvalidVbucket(99))));
    assert!(!h.bucket.contains("_idx:ABC:0:block0"));

    index.add_set(&[]).await.unwrap();
}
