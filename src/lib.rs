//! chanidx - A partitioned channel change index for multi-node document sync
//!
//! chanidx records, per channel, which document revisions landed at which global
//! sequence, and serves ordered range queries over that history to change feeds:
//! - Per-channel index blocks partitioned by vbucket, written with CAS
//! - A bounded in-process block cache
//! - Stable-sequence clamped reads and polling-based change notification
//! - Pluggable bucket backends (in-memory, S3)

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
