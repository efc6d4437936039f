//! Broadcast domain model.
//!
//! # Responsibility
//! - Define entity identity, change events, channel ids and wire markers.
//!
//! # Invariants
//! - Channels are keyed by entity type and id only, never by entity state.
//! - Markers are liveness hints; the authoritative state is always re-fetched.

pub mod channel;
pub mod entity;
pub mod marker;
