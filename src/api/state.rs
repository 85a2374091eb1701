//! API server state

use std::sync::Arc;

use crate::index::{BucketStableSequence, KvChangeIndex};

/// API server state
#[derive(Clone)]
pub struct AppState {
    /// The change index served by this node
    pub index: Arc<KvChangeIndex>,

    /// Set when this node owns the stable sequence, e.g. an in-memory bucket
    /// that no other process can advance
    pub stable_writer: Option<Arc<BucketStableSequence>>,

    node_id: String,
}

impl AppState {
    pub fn new(index: Arc<KvChangeIndex>, node_id: impl Into<String>) -> Self {
        Self {
            index,
            stable_writer: None,
            node_id: node_id.into(),
        }
    }

    /// Accept stable sequence updates through the API
    pub fn with_stable_writer(mut self, writer: Arc<BucketStableSequence>) -> Self {
        self.stable_writer = Some(writer);
        self
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}
