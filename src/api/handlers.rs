//! API handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::index::partition::vbucket_for_key;
use crate::index::ChangeIndex;
use crate::types::{CachedChanges, ChangesOptions, LogEntry, SequenceId, VbNo};
use crate::Error;

fn error_response(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::InvalidChannel(_)
        | Error::InvalidVbucket(_)
        | Error::InvalidDocument(_)
        | Error::Decode(_) => StatusCode::BAD_REQUEST,
        Error::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Health check with index status
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.node_id().to_string(),
        initialized: state.index.is_initialized(),
        indexing_enabled: state.index.is_indexing_enabled(),
        channels: state.index.channel_count(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub initialized: bool,
    pub indexing_enabled: bool,
    pub channels: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangesQuery {
    pub since: Option<String>,
    pub limit: Option<usize>,
    pub active_only: Option<bool>,
}

impl ChangesQuery {
    fn to_options(&self) -> Result<ChangesOptions, (StatusCode, String)> {
        let since = match self.since.as_deref() {
            Some(raw) if !raw.trim().is_empty() => raw
                .parse::<SequenceId>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
            _ => SequenceId::default(),
        };
        Ok(ChangesOptions {
            since,
            limit: self.limit.unwrap_or(0),
            active_only: self.active_only.unwrap_or(false),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<LogEntry>,
    pub last_seq: SequenceId,
}

/// Durable changes for a channel
pub async fn get_changes(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, (StatusCode, String)> {
    let options = query.to_options()?;

    let results = state
        .index
        .get_changes(&channel, &options)
        .await
        .map_err(error_response)?;

    let last_seq = results
        .last()
        .map(|entry| SequenceId::new(entry.sequence))
        .unwrap_or(options.since);

    Ok(Json(ChangesResponse { results, last_seq }))
}

/// Changes from the in-memory snapshot of the last notified range
pub async fn get_cached_changes(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<CachedChanges>, (StatusCode, String)> {
    let options = query.to_options()?;
    Ok(Json(state.index.get_cached_changes(&channel, &options)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DocChangedQuery {
    pub vb: Option<VbNo>,
}

/// Feed one document mutation to the index
///
/// Indexing failures are logged by the index rather than reported here.
pub async fn doc_changed(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<DocChangedQuery>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let partition_map = state
        .index
        .partition_map()
        .ok_or_else(|| error_response(Error::NotInitialized))?;

    let vb_no = query
        .vb
        .unwrap_or_else(|| vbucket_for_key(&doc_id, partition_map.num_vbuckets() as VbNo));

    state.index.doc_changed(&doc_id, &body, vb_no).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StableSequenceResponse {
    pub stable_sequence: SequenceId,
}

pub async fn stable_sequence(State(state): State<AppState>) -> Json<StableSequenceResponse> {
    Json(StableSequenceResponse {
        stable_sequence: state.index.get_stable_sequence("").await,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StableSequenceRequest {
    pub stable_sequence: u64,
}

/// Advance the stable sequence on nodes that own it
pub async fn advance_stable_sequence(
    State(state): State<AppState>,
    Json(payload): Json<StableSequenceRequest>,
) -> Result<Json<StableSequenceResponse>, (StatusCode, String)> {
    let writer = state.stable_writer.as_ref().ok_or_else(|| {
        (
            StatusCode::CONFLICT,
            "stable sequence is owned by an external writer".to_string(),
        )
    })?;

    writer
        .advance(payload.stable_sequence)
        .await
        .map_err(error_response)?;

    Ok(Json(StableSequenceResponse {
        stable_sequence: state.index.get_stable_sequence("").await,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexingRequest {
    pub enabled: bool,
}

/// Toggle channel indexing for incoming mutations
pub async fn set_indexing(
    State(state): State<AppState>,
    Json(payload): Json<IndexingRequest>,
) -> Json<IndexingRequest> {
    state.index.enable_channel_indexing(payload.enabled);
    Json(IndexingRequest {
        enabled: state.index.is_indexing_enabled(),
    })
}
