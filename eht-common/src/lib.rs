//! # EHT Common Library
//!
//! Shared code for the error-handling review services:
//! - Common error taxonomy (`Error`, `Result`)
//! - Bootstrap configuration and root folder resolution
//! - SQLite pool initialization and review schema
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
