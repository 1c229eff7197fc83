//! Records and request/response types for the detection workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::Classification;
use crate::render::RenderPayload;

/// Workflow type recorded on every session created by this service
pub const WORKFLOW_DETECTION: &str = "detection";

pub const DEFAULT_PROJECT_NAME: &str = "Untitled Project";

/// One review workflow instance (`detection_sessions` row)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSession {
    pub id: i64,
    pub user_id: i64,
    pub project_name: String,
    pub workflow_type: String,
    pub dataset_path: String,
    pub mask_path: Option<String>,
    /// Fixed at load time
    pub total_layers: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Values needed to create a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub project_name: String,
    pub dataset_path: String,
    pub mask_path: Option<String>,
}

/// One frame's review record (`detection_layers` row)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionLayer {
    pub id: i64,
    pub session_id: i64,
    pub layer_index: i64,
    pub layer_name: String,
    pub classification: Classification,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Requests
// ============================================================================

fn default_project_name() -> String {
    DEFAULT_PROJECT_NAME.to_string()
}

fn default_page() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadRequest {
    pub dataset_path: String,
    #[serde(default)]
    pub mask_path: Option<String>,
    #[serde(default = "default_project_name")]
    pub project_name: String,
}

/// Query string of `GET /detection/layers`
#[derive(Debug, Clone, Deserialize)]
pub struct LayersQuery {
    pub session_id: i64,
    #[serde(default = "default_page")]
    pub page: i64,
    /// Falls back to the configured default page size
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default = "default_true")]
    pub include_images: bool,
    /// Falls back to the configured enhancement default
    #[serde(default)]
    pub enhance: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRequest {
    pub session_id: i64,
    pub layer_ids: Vec<i64>,
    /// Validated by the engine so the error names the allowed values
    pub classification: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    pub session_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveMaskRequest {
    pub session_id: i64,
    pub layer_index: i64,
    /// Base64 image, optionally prefixed with `data:<mime>;base64,`
    pub mask_base64: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResponse {
    pub session_id: i64,
    pub total_layers: i64,
    pub project_name: String,
    pub is_3d: bool,
    /// [height, width]
    pub image_shape: [usize; 2],
    pub has_masks: bool,
}

/// One layer of a page, optionally with rendered payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInfo {
    pub id: i64,
    pub layer_index: i64,
    pub layer_name: String,
    pub classification: Classification,
    pub image_base64: Option<RenderPayload>,
    pub mask_base64: Option<RenderPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayersPage {
    pub layers: Vec<LayerInfo>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifyResponse {
    pub updated_count: u64,
    pub message: String,
}

/// Plain acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
