//! Test Helper Utilities
//!
//! Shared utilities for testing eht-detect

#![allow(dead_code)]

pub mod app;
pub mod datasets;

// Re-export commonly used items
pub use app::{create_test_app, create_test_engine, session_count};
pub use datasets::{label_png_base64, write_gray_png, write_npy_stack, DatasetDir};
