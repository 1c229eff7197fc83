//! Detection review API handlers
//!
//! POST /detection/load, GET /detection/layers, POST /detection/classify,
//! GET /detection/stats, POST /detection/mask, DELETE /detection/session/:session_id
//!
//! Extractor rejections are taken as `Result`s so malformed bodies and query
//! strings come back in the same error envelope as engine failures.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{delete, get, post},
    Json, Router,
};

use crate::api::identity::CallerId;
use crate::classification::DetectionStats;
use crate::error::ApiResult;
use crate::models::{
    ClassifyRequest, ClassifyResponse, LayersPage, LayersQuery, LoadRequest, LoadResponse,
    MessageResponse, SaveMaskRequest, StatsQuery,
};
use crate::AppState;

/// POST /detection/load
///
/// Decode a dataset (and optional mask volume) and open a review session.
pub async fn load_dataset(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    payload: Result<Json<LoadRequest>, JsonRejection>,
) -> ApiResult<Json<LoadResponse>> {
    let Json(request) = payload?;
    let response = state.engine.load_dataset(user_id, request).await?;
    Ok(Json(response))
}

/// GET /detection/layers?session_id=&page=&page_size=&include_images=&enhance=
pub async fn get_layers(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    query: Result<Query<LayersQuery>, QueryRejection>,
) -> ApiResult<Json<LayersPage>> {
    let Query(query) = query?;
    let page = state.engine.get_layers(user_id, &query).await?;
    Ok(Json(page))
}

/// POST /detection/classify
///
/// Unknown or foreign layer ids are skipped, not rejected.
pub async fn classify_layers(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    payload: Result<Json<ClassifyRequest>, JsonRejection>,
) -> ApiResult<Json<ClassifyResponse>> {
    let Json(request) = payload?;
    let response = state.engine.classify_layers(user_id, request).await?;
    Ok(Json(response))
}

/// GET /detection/stats?session_id=
pub async fn get_stats(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> ApiResult<Json<DetectionStats>> {
    let Query(query) = query?;
    let stats = state.engine.get_stats(user_id, query.session_id).await?;
    Ok(Json(stats))
}

/// POST /detection/mask
pub async fn save_mask(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    payload: Result<Json<SaveMaskRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Json(request) = payload?;
    let response = state.engine.save_mask(user_id, request).await?;
    Ok(Json(response))
}

/// DELETE /detection/session/:session_id
pub async fn delete_session(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    session_id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Path(session_id) = session_id?;
    let response = state.engine.delete_session(user_id, session_id).await?;
    Ok(Json(response))
}

/// Build detection routes
pub fn detection_routes() -> Router<AppState> {
    Router::new()
        .route("/detection/load", post(load_dataset))
        .route("/detection/layers", get(get_layers))
        .route("/detection/classify", post(classify_layers))
        .route("/detection/stats", get(get_stats))
        .route("/detection/mask", post(save_mask))
        .route("/detection/session/:session_id", delete(delete_session))
}
