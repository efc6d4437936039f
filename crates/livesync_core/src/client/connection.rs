//! In-process client connection on top of the subscription gateway.
//!
//! # Responsibility
//! - Map client channel subscriptions onto gateway subscriptions.
//! - Pump the connection inbox into a client registry.
//!
//! # Invariants
//! - One hub connection per `ClientConnection`; closing it disconnects every
//!   gateway subscription it opened.

use crate::client::registry::{
    ChannelSubscription, ClientRegistry, ClientSubscribeError, ClientTransport, RefreshHost,
};
use crate::gateway::{SubscribeOutcome, SubscribeRequest, SubscriptionGateway};
use crate::model::channel::ChannelId;
use crate::schema::auth::SubscriberContext;
use crate::transport::ConnectionId;
use log::{debug, info};
use std::sync::Arc;

/// `ClientTransport` that subscribes through a [`SubscriptionGateway`].
pub struct GatewayClientTransport {
    gateway: Arc<SubscriptionGateway>,
    connection: ConnectionId,
    context: SubscriberContext,
}

impl GatewayClientTransport {
    pub fn new(
        gateway: Arc<SubscriptionGateway>,
        connection: ConnectionId,
        context: SubscriberContext,
    ) -> Self {
        Self {
            gateway,
            connection,
            context,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl ClientTransport for GatewayClientTransport {
    fn subscribe(
        &mut self,
        channel: &ChannelId,
    ) -> Result<ChannelSubscription, ClientSubscribeError> {
        let request = SubscribeRequest::from_channel(channel);
        match self.gateway.subscribe(self.connection, &request, &self.context)? {
            SubscribeOutcome::Subscribed(handle) => Ok(ChannelSubscription {
                requested: channel.clone(),
                streamed: handle.channels.into_iter().collect(),
                token: handle.id,
            }),
            SubscribeOutcome::Rejected(reason) => Err(reason.into()),
        }
    }

    fn unsubscribe(&mut self, subscription: &ChannelSubscription) {
        if !self.gateway.unsubscribe(subscription.token) {
            debug!(
                "event=client_unsubscribe module=client status=skip reason=unknown_subscription channel={}",
                subscription.requested
            );
        }
    }
}

/// Client end of one hub connection.
pub struct ClientConnection {
    gateway: Arc<SubscriptionGateway>,
    id: ConnectionId,
}

impl ClientConnection {
    /// Opens a fresh connection on the gateway's hub.
    pub fn connect(gateway: Arc<SubscriptionGateway>) -> Self {
        let id = gateway.hub().open_connection();
        info!(
            "event=client_connect module=client status=ok connection={}",
            id
        );
        Self { gateway, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport bound to this connection and subscriber.
    pub fn transport(&self, context: SubscriberContext) -> GatewayClientTransport {
        GatewayClientTransport::new(Arc::clone(&self.gateway), self.id, context)
    }

    /// Drains the inbox into `registry` at `now_ms`.
    ///
    /// Returns the number of envelopes the registry accepted.
    pub fn pump<T, H>(&self, registry: &mut ClientRegistry<T, H>, now_ms: u64) -> usize
    where
        T: ClientTransport,
        H: RefreshHost,
    {
        let envelopes = self.gateway.hub().drain(self.id);
        let received = envelopes.len();
        let accepted = envelopes
            .iter()
            .filter(|envelope| registry.handle_envelope(envelope, now_ms))
            .count();
        if received > 0 {
            debug!(
                "event=client_pump module=client status=ok connection={} received={} accepted={}",
                self.id, received, accepted
            );
        }
        accepted
    }

    /// Disconnects, ending every gateway subscription of this connection.
    pub fn close(self) -> usize {
        self.gateway.disconnect(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientConnection;
    use crate::client::debounce::ReconcilerConfig;
    use crate::client::registry::{ClientRegistry, DesiredChannels, RefreshHost};
    use crate::gateway::SubscriptionGateway;
    use crate::model::channel::ChannelId;
    use crate::model::entity::{EntityRecord, EntityRef};
    use crate::model::marker::Marker;
    use crate::schema::auth::{AuthorizationOracle, SubscriberContext};
    use crate::schema::reflect::{AssociationDescriptor, ModelSchema};
    use crate::schema::resolve::{EntityResolver, ResolveResult};
    use crate::transport::{ChannelHub, MarkerTransport};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    struct SingleAccount;

    impl EntityResolver for SingleAccount {
        fn find(&self, entity: &EntityRef) -> ResolveResult<Option<EntityRecord>> {
            Ok((entity.entity_type == "Account" && entity.entity_id == "1")
                .then(|| EntityRecord::new("Account", "1")))
        }

        fn resolve_singular(
            &self,
            _: &EntityRecord,
            _: &AssociationDescriptor,
        ) -> ResolveResult<Option<EntityRef>> {
            Ok(None)
        }

        fn resolve_collection(
            &self,
            _: &EntityRecord,
            _: &AssociationDescriptor,
        ) -> ResolveResult<Vec<EntityRef>> {
            Ok(Vec::new())
        }
    }

    struct OpenOracle;

    impl AuthorizationOracle for OpenOracle {
        fn is_accessible_by(&self, _: &EntityRecord, _: &SubscriberContext) -> bool {
            true
        }

        fn is_privileged(&self, _: &SubscriberContext) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Refreshes(Vec<BTreeSet<String>>);

    impl RefreshHost for Refreshes {
        fn refresh(&mut self, props: &BTreeSet<String>) {
            self.0.push(props.clone());
        }
    }

    fn gateway() -> Arc<SubscriptionGateway> {
        Arc::new(SubscriptionGateway::new(
            Arc::new(ModelSchema::new()),
            Arc::new(SingleAccount),
            Arc::new(OpenOracle),
            Arc::new(ChannelHub::new()),
        ))
    }

    #[test]
    fn pump_feeds_markers_and_close_disconnects() {
        let gateway = gateway();
        let connection = ClientConnection::connect(Arc::clone(&gateway));
        let mut registry = ClientRegistry::register(
            connection.transport(SubscriberContext::new("alice")),
            Refreshes::default(),
            DesiredChannels::new()
                .with("Account:1", "account")
                .with("Account:all", "accounts"),
            ReconcilerConfig::default(),
        );
        assert_eq!(registry.active_channels(), vec!["Account:1".to_string()]);
        assert_eq!(gateway.subscription_count(), 1);

        let channel = ChannelId::parse("Account:1").unwrap();
        gateway
            .hub()
            .broadcast(&Marker::refresh(&channel, "account"))
            .unwrap();
        assert_eq!(connection.pump(&mut registry, 10), 1);
        assert!(registry.tick(310));
        assert_eq!(registry.host().0.len(), 1);

        assert_eq!(connection.close(), 1);
        assert_eq!(gateway.subscription_count(), 0);
        assert_eq!(gateway.hub().stream_count(), 0);
    }

    #[test]
    fn teardown_unsubscribes_on_gateway() {
        let gateway = gateway();
        let connection = ClientConnection::connect(Arc::clone(&gateway));
        let mut registry = ClientRegistry::register(
            connection.transport(SubscriberContext::new("alice")),
            Refreshes::default(),
            DesiredChannels::new().with("Account:1", "account"),
            ReconcilerConfig::default(),
        );
        assert_eq!(gateway.hub().listener_count("Account:1"), 1);

        registry.teardown();
        assert_eq!(gateway.subscription_count(), 0);
        assert_eq!(gateway.hub().listener_count("Account:1"), 0);
    }
}
