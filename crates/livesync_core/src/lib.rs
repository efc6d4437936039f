//! Model-change broadcast and reactive synchronization.
//! Persistence commits become channel markers; clients turn marker bursts into
//! one consolidated refresh.

pub mod broadcast;
pub mod client;
pub mod db;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod schema;
pub mod service;
pub mod store;
pub mod transport;

pub use broadcast::{
    BroadcastConfigError, BroadcastRegistry, BroadcastTarget, ChangePublisher, CommitHook,
};
pub use client::{
    ClientConnection, ClientRegistry, ClientTransport, DesiredChannels, ReconcilerConfig,
    RefreshHost,
};
pub use gateway::{RejectReason, SubscribeOutcome, SubscribeRequest, SubscriptionGateway};
pub use logging::{
    default_log_level, init_logging, init_logging_with, logging_status, LoggingConfig,
};
pub use model::channel::{ChannelId, ChannelIdError, ChannelSelector};
pub use model::entity::{ChangeOperation, EntityRecord, EntityRef};
pub use model::marker::{Envelope, Marker, MarkerAction};
pub use schema::auth::{AuthorizationOracle, SubscriberContext, SubscriberIdentity};
pub use schema::reflect::{
    AssociationDescriptor, AssociationReflector, AssociationStorage, Cardinality, ModelSchema,
};
pub use schema::resolve::{EntityResolver, ResolveError, ResolveResult, SnapshotSource};
pub use service::{EntityService, NewEntity};
pub use store::{SqliteAccessOracle, SqliteEntityStore, StoreError};
pub use transport::{ChannelHub, MarkerTransport, TransportError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
