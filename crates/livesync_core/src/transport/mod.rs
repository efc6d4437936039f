//! Marker transport.
//!
//! # Responsibility
//! - Carry markers from the publisher to the streams the gateway opened.
//!
//! # Invariants
//! - Delivery is at-most-once and best-effort; nothing is retried or replayed.

pub mod hub;

pub use hub::{
    ChannelHub, ConnectionId, MarkerTransport, StreamId, TransportError, TransportResult,
};
