//! HTTP API server

use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod state;

pub use state::AppState;

/// Build the API router using the provided application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .nest(
            "/v1",
            Router::new()
                .route("/channels/:channel/changes", get(handlers::get_changes))
                .route(
                    "/channels/:channel/cached_changes",
                    get(handlers::get_cached_changes),
                )
                .route("/docs/:doc_id", post(handlers::doc_changed))
                .route(
                    "/stable_sequence",
                    get(handlers::stable_sequence).put(handlers::advance_stable_sequence),
                )
                .route("/indexing", put(handlers::set_indexing)),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
