//! Core types for chanidx

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{Error, Result};

/// Vbucket number
pub type VbNo = u16;

/// Partition identifier
pub type PartitionId = u16;

/// A set of channel names
pub type ChannelSet = BTreeSet<String>;

/// LogEntry flag bits
pub mod flags {
    pub const DELETED: u8 = 1;
    pub const REMOVED: u8 = 2;
    pub const HIDDEN: u8 = 4;
    pub const CONFLICT: u8 = 8;
    pub const BRANCHED: u8 = 16;
}

/// One document mutation, as stored at its entry key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    #[serde(rename = "id")]
    pub doc_id: String,
    #[serde(rename = "rev", default)]
    pub rev_id: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default)]
    pub flags: u8,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub channels: ChannelSet,
    #[serde(rename = "time_saved")]
    pub time_saved: chrono::DateTime<chrono::Utc>,
}

impl LogEntry {
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            sequence,
            flags: 0,
            channels: ChannelSet::new(),
            time_saved: chrono::Utc::now(),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.flags & flags::REMOVED != 0
    }

    pub fn set_removed(&mut self) {
        self.flags |= flags::REMOVED;
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }
}

/// Ordering key for change queries.
///
/// `triggered_by` is set for entries surfaced by a late channel grant. Equality,
/// ordering and hashing only look at `seq`, so range bounds ignore the qualifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceId {
    pub seq: u64,
    pub triggered_by: u64,
}

impl SequenceId {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            triggered_by: 0,
        }
    }

    pub fn triggered(triggered_by: u64, seq: u64) -> Self {
        Self { seq, triggered_by }
    }

    /// The sequence to resume from; qualifying context never lowers it.
    pub fn safe_sequence(&self) -> u64 {
        self.seq
    }
}

impl From<u64> for SequenceId {
    fn from(seq: u64) -> Self {
        Self::new(seq)
    }
}

impl PartialEq for SequenceId {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for SequenceId {}

impl PartialOrd for SequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl Hash for SequenceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seq.hash(state);
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.triggered_by > 0 {
            write!(f, "{}:{}", self.triggered_by, self.seq)
        } else {
            write!(f, "{}", self.seq)
        }
    }
}

impl FromStr for SequenceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| Error::decode(format!("invalid sequence id: {:?}", s)))
        };

        match s.split_once(':') {
            Some((triggered_by, seq)) => Ok(Self::triggered(parse(triggered_by)?, parse(seq)?)),
            None => Ok(Self::new(parse(s)?)),
        }
    }
}

impl Serialize for SequenceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.triggered_by > 0 {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_u64(self.seq)
        }
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(seq) => Ok(SequenceId::new(seq)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Options for change range queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesOptions {
    /// Exclusive lower bound
    #[serde(default)]
    pub since: SequenceId,
    /// Maximum number of entries to return, 0 for no limit
    #[serde(default)]
    pub limit: usize,
    /// Skip entries removed from the channel
    #[serde(default)]
    pub active_only: bool,
}

impl ChangesOptions {
    pub fn since(seq: u64) -> Self {
        Self {
            since: SequenceId::new(seq),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_active_only(mut self, active_only: bool) -> Self {
        self.active_only = active_only;
        self
    }
}

/// In-memory answer to a changes request
#[derive(Debug, Clone, Default, Serialize)]
pub struct CachedChanges {
    /// Lowest sequence the entries can be trusted from; anything earlier has to
    /// be fetched through the durable path.
    pub valid_from: u64,
    pub entries: Vec<LogEntry>,
}
