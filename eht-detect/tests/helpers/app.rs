//! Engine and router construction over an in-memory database

use std::sync::Arc;

use axum::Router;
use eht_common::db::init_memory_database;
use eht_detect::cache::SessionCache;
use eht_detect::engine::{ReviewEngine, ReviewOptions};
use eht_detect::{build_router, AppState};
use sqlx::SqlitePool;

/// Review engine with default options and an empty cache
pub async fn create_test_engine() -> ReviewEngine {
    let pool = init_memory_database()
        .await
        .expect("Failed to create in-memory database");
    ReviewEngine::new(pool, Arc::new(SessionCache::new()), ReviewOptions::default())
}

/// Full router plus the engine behind it
pub async fn create_test_app() -> (Router, ReviewEngine) {
    let engine = create_test_engine().await;
    let app = build_router(AppState::new(engine.clone()));
    (app, engine)
}

/// Number of rows in `detection_sessions`
pub async fn session_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM detection_sessions")
        .fetch_one(pool)
        .await
        .expect("Failed to count sessions")
}
