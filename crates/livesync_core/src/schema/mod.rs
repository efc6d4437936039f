//! Contracts consumed from the host domain model.
//!
//! # Responsibility
//! - Association reflection (`reflect`), authorization (`auth`) and entity
//!   resolution (`resolve`) seams.
//!
//! # Invariants
//! - Everything here is read-only and safe to share across request threads.

pub mod auth;
pub mod reflect;
pub mod resolve;
