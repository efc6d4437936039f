//! Use-case services.
//!
//! # Responsibility
//! - Run entity writes and hand committed changes to the broadcast layer.

pub mod entity_service;

pub use entity_service::{EntityService, NewEntity};
