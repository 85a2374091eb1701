//! Channel resolution for incoming document mutations
//!
//! A [`ChannelMapper`] turns a raw document body into the channels the
//! revision belongs to and the channels it was just removed from.
//! [`SyncMetadataMapper`] reads the `_sync` metadata that the sync layer
//! stores alongside each document.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::types::{flags, ChannelSet, LogEntry};
use crate::{Error, Result};

/// Channel every document is indexed into when star indexing is on
pub const STAR_CHANNEL: &str = "*";

/// Whether `name` may be used as a channel name
pub fn is_valid_channel_name(name: &str) -> bool {
    if name == STAR_CHANNEL {
        return true;
    }
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '+' | '=' | '/' | '_' | '.' | '@'))
}

/// What a mutation means for the channel index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentChange {
    pub sequence: u64,
    pub rev_id: String,
    pub deleted: bool,
    /// Channels the current revision is in
    pub channels: ChannelSet,
    /// Channels the document left with this revision
    pub removed: ChannelSet,
}

impl DocumentChange {
    /// The log entry recorded at the change's entry key
    pub fn log_entry(&self, doc_id: &str) -> LogEntry {
        let mut entry = LogEntry::new(doc_id, self.rev_id.clone(), self.sequence);
        entry.channels = self.channels.clone();
        if self.deleted {
            entry.flags |= flags::DELETED;
        }
        entry
    }

    /// Channels to index into, each paired with its removal flag
    pub fn targets(&self, include_star: bool) -> Vec<(String, bool)> {
        let mut targets: Vec<(String, bool)> = self
            .channels
            .iter()
            .map(|channel| (channel.clone(), false))
            .chain(
                self.removed
                    .iter()
                    .filter(|channel| !self.channels.contains(*channel))
                    .map(|channel| (channel.clone(), true)),
            )
            .collect();
        if include_star && !self.channels.contains(STAR_CHANNEL) {
            targets.push((STAR_CHANNEL.to_string(), false));
        }
        targets
    }
}

pub trait ChannelMapper: Send + Sync {
    fn resolve(&self, doc_id: &str, body: &[u8]) -> Result<DocumentChange>;
}

#[derive(Debug, Deserialize)]
struct SyncEnvelope {
    #[serde(rename = "_sync")]
    sync: Option<SyncMetadata>,
}

#[derive(Debug, Deserialize)]
struct SyncMetadata {
    #[serde(default)]
    rev: String,
    sequence: u64,
    #[serde(default)]
    flags: u8,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    channels: BTreeMap<String, Option<ChannelRemoval>>,
}

/// Set on a channel the document no longer belongs to
#[derive(Debug, Deserialize)]
struct ChannelRemoval {
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    rev: String,
    #[serde(default)]
    del: bool,
}

/// Resolves channels from a document's `_sync` metadata.
///
/// `channels` maps each channel name to `null` while the document is a
/// member, or to a removal record once it left. A removal only counts for
/// the revision that caused it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncMetadataMapper;

impl ChannelMapper for SyncMetadataMapper {
    fn resolve(&self, doc_id: &str, body: &[u8]) -> Result<DocumentChange> {
        let envelope: SyncEnvelope = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidDocument(format!("{}: {}", doc_id, e)))?;
        let sync = envelope
            .sync
            .ok_or_else(|| Error::InvalidDocument(format!("{}: missing _sync metadata", doc_id)))?;

        let mut change = DocumentChange {
            sequence: sync.sequence,
            rev_id: sync.rev,
            deleted: sync.deleted || sync.flags & flags::DELETED != 0,
            ..Default::default()
        };

        for (channel, removal) in sync.channels {
            match removal {
                None => {
                    change.channels.insert(channel);
                }
                Some(removal) if removal.seq != 0 && removal.seq == change.sequence => {
                    if removal.del {
                        change.deleted = true;
                    }
                    if change.rev_id.is_empty() {
                        change.rev_id = removal.rev;
                    }
                    change.removed.insert(channel);
                }
                Some(_) => {}
            }
        }

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(is_valid_channel_name("ABC"));
        assert!(is_valid_channel_name("user@example.com"));
        assert!(is_valid_channel_name("a-b_c.d/e+f=g"));
        assert!(is_valid_channel_name("*"));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("has space"));
        assert!(!is_valid_channel_name("a*"));
        assert!(!is_valid_channel_name("a:b"));
    }

    #[test]
    fn test_sync_metadata_mapper() {
        let body = br#"{
            "title": "hello",
            "_sync": {
                "rev": "3-abc",
                "sequence": 42,
                "channels": {
                    "ABC": null,
                    "NBC": {"seq": 42, "rev": "3-abc"},
                    "CBS": {"seq": 17, "rev": "1-xyz"}
                }
            }
        }"#;

        let change = SyncMetadataMapper.resolve("doc1", body).unwrap();
        assert_eq!(change.sequence, 42);
        assert_eq!(change.rev_id, "3-abc");
        assert!(!change.deleted);
        assert_eq!(change.channels, ChannelSet::from(["ABC".to_string()]));
        assert_eq!(change.removed, ChannelSet::from(["NBC".to_string()]));

        let targets = change.targets(true);
        assert_eq!(
            targets,
            vec![
                ("ABC".to_string(), false),
                ("NBC".to_string(), true),
                ("*".to_string(), false)
            ]
        );
        assert_eq!(change.targets(false).len(), 2);
    }

    #[test]
    fn test_removal_without_sequence_is_stale() {
        let body = br#"{"_sync": {"rev": "4-e", "sequence": 50, "channels": {"ABC": null, "NBC": {"rev": "2-b"}}}}"#;
        let change = SyncMetadataMapper.resolve("doc1", body).unwrap();
        assert!(change.removed.is_empty());
        assert_eq!(change.targets(false), vec![("ABC".to_string(), false)]);
    }

    #[test]
    fn test_deleted_document() {
        let body = br#"{"_sync": {"rev": "2-d", "sequence": 7, "flags": 1, "channels": {"ABC": null}}}"#;
        let change = SyncMetadataMapper.resolve("doc1", body).unwrap();
        assert!(change.deleted);
        assert!(change.log_entry("doc1").is_deleted());
    }

    #[test]
    fn test_missing_sync_metadata() {
        assert!(matches!(
            SyncMetadataMapper.resolve("doc1", br#"{"title": "x"}"#),
            Err(Error::InvalidDocument(_))
        ));
        assert!(SyncMetadataMapper.resolve("doc1", b"not json").is_err());
    }
}
