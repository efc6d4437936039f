//! Server-side broadcast: target declarations and the change publisher.
//!
//! # Responsibility
//! - Turn entity mutations into markers on the right channels.
//!
//! # Invariants
//! - Broadcasting is a side effect outside the mutation's transaction; it
//!   never fails or blocks the mutation.

pub mod publisher;
pub mod targets;

pub use publisher::{ChangePublisher, CommitHook};
pub use targets::{
    BroadcastConfigError, BroadcastRegistry, BroadcastTarget, PropOverrides, ResolvedTarget,
    TypeBroadcastConfig,
};
