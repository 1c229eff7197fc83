//! Session and layer persistence

pub mod layers;
pub mod sessions;

pub use layers::*;
pub use sessions::*;
