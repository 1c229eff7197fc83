//! HTTP API handlers for eht-detect

pub mod detection;
pub mod health;
pub mod identity;

pub use detection::detection_routes;
pub use health::health_routes;
pub use identity::{CallerId, USER_ID_HEADER};
