//! Subscription gateway.
//!
//! # Responsibility
//! - Authorize subscribe requests and wire transport streams for them.
//!
//! # Invariants
//! - Rejections are returned synchronously, never as silent timeouts.

pub mod request;
pub mod subscriptions;

pub use request::{
    RejectReason, SubscribeOutcome, SubscribeRequest, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
pub use subscriptions::SubscriptionGateway;
