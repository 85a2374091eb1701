//! Index blocks
//!
//! A block holds a presence marker for each of `capacity` consecutive
//! sequences of one (channel, partition) pair. Block index is
//! `sequence / capacity`, so the capacity must agree across every node.
//!
//! Block format:
//! - Magic bytes: "CIXB" (4 bytes)
//! - Version: u32 (4 bytes)
//! - Capacity: u64 (8 bytes)
//! - Block index: u64 (8 bytes)
//! - Partition: u16 (2 bytes)
//! - Markers: 2 bits per sequence, four sequences per byte
//! - CRC32: u32 (4 bytes) - checksum of everything before it

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::storage::Cas;
use crate::types::{PartitionId, VbNo};
use crate::{Error, Result};

const BLOCK_MAGIC: &[u8; 4] = b"CIXB";
const BLOCK_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 2;
const CRC_LEN: usize = 4;

/// Per-sequence marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Present,
    Removed,
}

impl EntryState {
    fn bits(self) -> u8 {
        match self {
            EntryState::Absent => 0,
            EntryState::Present => 1,
            EntryState::Removed => 2,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(EntryState::Absent),
            1 => Some(EntryState::Present),
            2 => Some(EntryState::Removed),
            _ => None,
        }
    }
}

/// A mutation event scoped to one vbucket, headed for a channel's index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub vb_no: VbNo,
    pub sequence: u64,
    pub removal: bool,
}

impl IndexEntry {
    pub fn new(vb_no: VbNo, sequence: u64, removal: bool) -> Self {
        Self {
            vb_no,
            sequence,
            removal,
        }
    }

    pub fn state(&self) -> EntryState {
        if self.removal {
            EntryState::Removed
        } else {
            EntryState::Present
        }
    }
}

/// Identifies a block within one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub partition: PartitionId,
    pub block_index: u64,
}

impl BlockId {
    pub fn new(partition: PartitionId, block_index: u64) -> Self {
        Self {
            partition,
            block_index,
        }
    }

    pub fn for_sequence(partition: PartitionId, sequence: u64, capacity: u64) -> Self {
        Self::new(partition, block_index_for(sequence, capacity))
    }
}

/// Block index holding `sequence`
pub fn block_index_for(sequence: u64, capacity: u64) -> u64 {
    sequence / capacity.max(1)
}

fn marker_len(capacity: u64) -> usize {
    capacity.div_ceil(4) as usize
}

/// Presence markers for one block, plus the CAS token of the copy they came from
#[derive(Debug, Clone)]
pub struct IndexBlock {
    channel: String,
    id: BlockId,
    capacity: u64,
    markers: Vec<u8>,
    cas: Cas,
}

impl IndexBlock {
    /// An empty block that has never been written
    pub fn new(channel: impl Into<String>, id: BlockId, capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel: channel.into(),
            id,
            capacity,
            markers: vec![0; marker_len(capacity)],
            cas: Cas::none(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// First sequence covered by this block
    pub fn start_sequence(&self) -> u64 {
        self.id.block_index.saturating_mul(self.capacity)
    }

    /// One past the last sequence covered by this block
    pub fn end_sequence(&self) -> u64 {
        self.start_sequence().saturating_add(self.capacity)
    }

    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.start_sequence() && sequence < self.end_sequence()
    }

    pub fn cas(&self) -> &Cas {
        &self.cas
    }

    pub fn set_cas(&mut self, cas: Cas) {
        self.cas = cas;
    }

    pub fn state(&self, sequence: u64) -> EntryState {
        if !self.contains(sequence) {
            return EntryState::Absent;
        }
        let offset = (sequence - self.start_sequence()) as usize;
        let bits = (self.markers[offset / 4] >> ((offset % 4) * 2)) & 0b11;
        EntryState::from_bits(bits).unwrap_or(EntryState::Absent)
    }

    pub fn set(&mut self, sequence: u64, state: EntryState) -> Result<()> {
        if !self.contains(sequence) {
            return Err(Error::index(format!(
                "sequence {} outside block {} of channel {} ({}..{})",
                sequence,
                self.id.block_index,
                self.channel,
                self.start_sequence(),
                self.end_sequence()
            )));
        }
        let offset = (sequence - self.start_sequence()) as usize;
        let shift = (offset % 4) * 2;
        let byte = &mut self.markers[offset / 4];
        *byte = (*byte & !(0b11 << shift)) | (state.bits() << shift);
        Ok(())
    }

    /// Apply a batch of entries; the batch must target this block
    pub fn apply(&mut self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            self.set(entry.sequence, entry.state())?;
        }
        Ok(())
    }

    /// Non-absent markers in `from..=through`, ascending
    pub fn entries(&self, from: u64, through: u64) -> Vec<(u64, EntryState)> {
        let from = from.max(self.start_sequence());
        let end = through.min(self.end_sequence().saturating_sub(1));
        if from > end {
            return Vec::new();
        }
        (from..=end)
            .filter_map(|sequence| match self.state(sequence) {
                EntryState::Absent => None,
                state => Some((sequence, state)),
            })
            .collect()
    }

    /// Number of non-absent markers
    pub fn len(&self) -> usize {
        self.entries(self.start_sequence(), self.end_sequence().saturating_sub(1))
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.iter().all(|b| *b == 0)
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + self.markers.len() + CRC_LEN);
        buffer.put_slice(BLOCK_MAGIC);
        buffer.put_u32(BLOCK_VERSION);
        buffer.put_u64(self.capacity);
        buffer.put_u64(self.id.block_index);
        buffer.put_u16(self.id.partition);
        buffer.put_slice(&self.markers);

        let crc = crc32fast::hash(&buffer);
        buffer.put_u32(crc);
        buffer.freeze()
    }

    /// Decode a stored block, checking it is the block `id` of `channel` at
    /// the configured `capacity`.
    pub fn decode(
        channel: &str,
        id: BlockId,
        capacity: u64,
        data: &[u8],
        cas: Cas,
    ) -> Result<Self> {
        if data.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::decode(format!(
                "index block too short: {} bytes",
                data.len()
            )));
        }

        let (body, mut crc_bytes) = data.split_at(data.len() - CRC_LEN);
        let stored_crc = crc_bytes.get_u32();
        let calculated_crc = crc32fast::hash(body);
        if stored_crc != calculated_crc {
            return Err(Error::decode(format!(
                "index block CRC mismatch (expected: {}, got: {})",
                stored_crc, calculated_crc
            )));
        }

        let mut header = body;
        if &header[..4] != BLOCK_MAGIC {
            return Err(Error::decode("invalid index block: bad magic bytes"));
        }
        header.advance(4);

        let version = header.get_u32();
        if version != BLOCK_VERSION {
            return Err(Error::decode(format!(
                "unsupported index block version: {}",
                version
            )));
        }

        let stored_capacity = header.get_u64();
        if stored_capacity != capacity {
            return Err(Error::decode(format!(
                "index block capacity {} does not match configured capacity {}",
                stored_capacity, capacity
            )));
        }

        let block_index = header.get_u64();
        let partition = header.get_u16();
        let stored_id = BlockId::new(partition, block_index);
        if stored_id != id {
            return Err(Error::decode(format!(
                "index block identity mismatch: stored {:?}, expected {:?}",
                stored_id, id
            )));
        }

        if header.remaining() != marker_len(capacity) {
            return Err(Error::decode(format!(
                "index block has {} marker bytes, expected {}",
                header.remaining(),
                marker_len(capacity)
            )));
        }

        let markers = header.to_vec();
        let has_invalid_marker = markers
            .iter()
            .any(|byte| (0..4).any(|slot| (byte >> (slot * 2)) & 0b11 == 0b11));
        if has_invalid_marker {
            return Err(Error::decode("index block contains an invalid marker"));
        }

        Ok(Self {
            channel: channel.to_string(),
            id,
            capacity,
            markers,
            cas,
        })
    }
}
