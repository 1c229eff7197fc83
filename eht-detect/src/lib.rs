//! eht-detect library interface
//!
//! Exposes the review engine and HTTP router for the binary and for
//! integration testing.

pub mod api;
pub mod cache;
pub mod classification;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod format;
pub mod mask;
pub mod models;
pub mod pagination;
pub mod render;
pub mod volume;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::ReviewEngine;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Detection review engine (database pool and volume cache)
    pub engine: ReviewEngine,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: ReviewEngine) -> Self {
        Self {
            engine,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::detection_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
