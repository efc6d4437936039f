//! Subscription gateway: authorize subscribe requests and wire streams.
//!
//! # Responsibility
//! - Validate and authorize inbound subscribe requests.
//! - Open transport streams for accepted requests, expanding collection
//!   requests into one stream per member self-channel.
//! - Tear streams down on unsubscribe and disconnect.
//!
//! # Invariants
//! - Streams are opened only after every check passed; a rejected or failed
//!   attempt leaves no stream behind.
//! - `Type:all` requires a privileged subscriber.
//! - `id/association` requests only succeed for declared collection
//!   associations.
//! - A subscription is recorded only while its connection is still open.
//! - Authorization is read-only; no locks are held while calling the resolver
//!   or the oracle.

use crate::gateway::request::{
    RejectReason, SubscribeOutcome, SubscribeRequest, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
use crate::model::channel::{ChannelId, ChannelSelector};
use crate::model::entity::{EntityRecord, EntityRef};
use crate::model::marker::Envelope;
use crate::schema::auth::{AuthorizationOracle, SubscriberContext, SubscriberIdentity};
use crate::schema::reflect::AssociationReflector;
use crate::schema::resolve::{EntityResolver, SnapshotSource};
use crate::transport::{ChannelHub, ConnectionId, StreamId, TransportError, TransportResult};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ActiveSubscription {
    connection: ConnectionId,
    subscriber: SubscriberIdentity,
    handle: SubscriptionHandle,
}

/// Channels an accepted request streams, plus the record to snapshot.
struct Authorized {
    channels: Vec<ChannelId>,
    snapshot_of: Option<EntityRecord>,
}

/// Server-side subscribe endpoint shared by every connection.
pub struct SubscriptionGateway {
    reflector: Arc<dyn AssociationReflector>,
    resolver: Arc<dyn EntityResolver>,
    oracle: Arc<dyn AuthorizationOracle>,
    hub: Arc<ChannelHub>,
    live_types: BTreeMap<String, Arc<dyn SnapshotSource>>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
}

impl SubscriptionGateway {
    pub fn new(
        reflector: Arc<dyn AssociationReflector>,
        resolver: Arc<dyn EntityResolver>,
        oracle: Arc<dyn AuthorizationOracle>,
        hub: Arc<ChannelHub>,
    ) -> Self {
        Self {
            reflector,
            resolver,
            oracle,
            hub,
            live_types: BTreeMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `entity_type` as live: accepted `Type:id` subscriptions get one
    /// immediate snapshot from `source`.
    pub fn with_live_type(
        mut self,
        entity_type: impl Into<String>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        self.live_types.insert(entity_type.into(), source);
        self
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    /// Handles one subscribe attempt.
    ///
    /// # Errors
    /// - Returns a transport error when streams cannot be opened; any stream
    ///   already opened for the attempt is closed again.
    /// - Returns `UnknownConnection` when the connection closed while the
    ///   streams were being opened.
    ///
    /// Authorization failures are not errors; they come back as
    /// `SubscribeOutcome::Rejected`.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        request: &SubscribeRequest,
        context: &SubscriberContext,
    ) -> TransportResult<SubscribeOutcome> {
        let mut state = SubscriptionState::Unsubscribed;
        advance(&mut state, SubscriptionState::Pending, request, context);

        let authorized = match request
            .parse()
            .and_then(|channel| self.authorize(&channel, context).map(|ok| (channel, ok)))
        {
            Ok(authorized) => authorized,
            Err(reason) => {
                advance(&mut state, SubscriptionState::Rejected(reason), request, context);
                return Ok(SubscribeOutcome::Rejected(reason));
            }
        };
        let (requested, Authorized {
            channels,
            snapshot_of,
        }) = authorized;

        let streams = self.open_streams(connection, &channels)?;
        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            requested: requested.to_string(),
            channels: channels.iter().map(ToString::to_string).collect(),
            streams,
        };

        {
            // `disconnect` closes the hub connection under this lock.
            let mut subscriptions = self.lock();
            if !self.hub.is_connected(connection) {
                drop(subscriptions);
                self.close_streams(&handle.streams);
                warn!(
                    "event=subscribe module=gateway status=error stage=record connection={} error=connection_closed",
                    connection
                );
                return Err(TransportError::UnknownConnection(connection));
            }
            subscriptions.insert(
                handle.id,
                ActiveSubscription {
                    connection,
                    subscriber: context.subscriber.clone(),
                    handle: handle.clone(),
                },
            );
        }

        if let Some(record) = snapshot_of {
            self.push_snapshot(connection, &requested, &record);
        }
        advance(&mut state, SubscriptionState::Subscribed, request, context);
        Ok(SubscribeOutcome::Subscribed(handle))
    }

    /// Subscribes by raw channel id string (`Type:selector[/association]`).
    pub fn subscribe_channel(
        &self,
        connection: ConnectionId,
        channel_id: &str,
        context: &SubscriberContext,
    ) -> TransportResult<SubscribeOutcome> {
        let request = match channel_id.trim().split_once(':') {
            Some((entity_type, selector)) => SubscribeRequest::new(entity_type, selector),
            None => SubscribeRequest::without_selector(channel_id.trim()),
        };
        self.subscribe(connection, &request, context)
    }

    /// Ends one subscription and closes every stream it opened.
    ///
    /// Returns `false` when the id is unknown (already gone).
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let removed = self.lock().remove(&subscription);
        let Some(active) = removed else {
            return false;
        };
        self.close_streams(&active.handle.streams);
        info!(
            "event=subscription_state module=gateway status=unsubscribed subscription={} subscriber={} channel={}",
            subscription, active.subscriber, active.handle.requested
        );
        true
    }

    /// Ends every subscription of `connection` and drops the connection.
    ///
    /// Returns the number of subscriptions torn down.
    pub fn disconnect(&self, connection: ConnectionId) -> usize {
        let removed: Vec<ActiveSubscription> = {
            let mut subscriptions = self.lock();
            let ids: Vec<SubscriptionId> = subscriptions
                .iter()
                .filter(|(_, active)| active.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            self.hub.close_connection(connection);
            ids.iter()
                .filter_map(|id| subscriptions.remove(id))
                .collect()
        };
        info!(
            "event=connection_closed module=gateway status=ok connection={} subscriptions={}",
            connection,
            removed.len()
        );
        removed.len()
    }

    /// Accepted subscriptions of one connection.
    pub fn active_subscriptions(&self, connection: ConnectionId) -> Vec<SubscriptionHandle> {
        let mut handles: Vec<SubscriptionHandle> = self
            .lock()
            .values()
            .filter(|active| active.connection == connection)
            .map(|active| active.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.requested.cmp(&b.requested));
        handles
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }

    fn authorize(
        &self,
        channel: &ChannelId,
        context: &SubscriberContext,
    ) -> Result<Authorized, RejectReason> {
        match channel.selector() {
            ChannelSelector::All => {
                if !self.oracle.is_privileged(context) {
                    return Err(RejectReason::Unauthorized);
                }
                Ok(Authorized {
                    channels: vec![channel.clone()],
                    snapshot_of: None,
                })
            }
            ChannelSelector::Id(id) => {
                let record = self.authorized_record(channel.entity_type(), id, context)?;
                let snapshot_of = self
                    .live_types
                    .contains_key(channel.entity_type())
                    .then_some(record);
                Ok(Authorized {
                    channels: vec![channel.clone()],
                    snapshot_of,
                })
            }
            ChannelSelector::Association { id, name } => {
                let parent = self.authorized_record(channel.entity_type(), id, context)?;
                let association = self
                    .reflector
                    .reflect_association(channel.entity_type(), name)
                    .filter(|association| association.is_collection())
                    .ok_or(RejectReason::EmptyCollection)?;
                let members = match self.resolver.resolve_collection(&parent, &association) {
                    Ok(members) => members,
                    Err(err) => {
                        warn!(
                            "event=subscribe module=gateway status=error stage=resolve_collection parent={} association={} error={}",
                            parent.entity, name, err
                        );
                        Vec::new()
                    }
                };
                if members.is_empty() {
                    return Err(RejectReason::EmptyCollection);
                }
                Ok(Authorized {
                    channels: members.iter().map(ChannelId::for_entity).collect(),
                    snapshot_of: None,
                })
            }
        }
    }

    fn authorized_record(
        &self,
        entity_type: &str,
        id: &str,
        context: &SubscriberContext,
    ) -> Result<EntityRecord, RejectReason> {
        let entity = EntityRef::new(entity_type, id);
        let record = match self.resolver.find(&entity) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(RejectReason::NotFound),
            Err(err) => {
                warn!(
                    "event=subscribe module=gateway status=error stage=find entity={} error={}",
                    entity, err
                );
                return Err(RejectReason::NotFound);
            }
        };
        if !self.oracle.is_accessible_by(&record, context) {
            return Err(RejectReason::Unauthorized);
        }
        Ok(record)
    }

    fn open_streams(
        &self,
        connection: ConnectionId,
        channels: &[ChannelId],
    ) -> TransportResult<Vec<StreamId>> {
        let mut opened = Vec::with_capacity(channels.len());
        for channel in channels {
            match self.hub.open_stream(connection, channel) {
                Ok(stream) => opened.push(stream),
                Err(err) => {
                    self.close_streams(&opened);
                    warn!(
                        "event=subscribe module=gateway status=error stage=open_stream channel={} rolled_back={} error={}",
                        channel,
                        opened.len(),
                        err
                    );
                    return Err(err);
                }
            }
        }
        Ok(opened)
    }

    fn close_streams(&self, streams: &[StreamId]) {
        for stream in streams {
            // Streams are already gone when the hub dropped the connection.
            if let Err(err) = self.hub.close_stream(*stream) {
                debug!(
                    "event=close_stream module=gateway status=skip stream={} error={}",
                    stream, err
                );
            }
        }
    }

    fn push_snapshot(&self, connection: ConnectionId, channel: &ChannelId, record: &EntityRecord) {
        let Some(source) = self.live_types.get(record.entity_type()) else {
            return;
        };
        let Some(state) = source.snapshot(record) else {
            return;
        };
        let envelope = Envelope::Snapshot {
            channel_id: channel.to_string(),
            state,
        };
        if let Err(err) = self.hub.deliver(connection, envelope) {
            debug!(
                "event=push_snapshot module=gateway status=dropped channel={} error={}",
                channel, err
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, ActiveSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn advance(
    state: &mut SubscriptionState,
    next: SubscriptionState,
    request: &SubscribeRequest,
    context: &SubscriberContext,
) {
    debug_assert!(state.can_transition_to(next));
    let selector = request.selector.as_deref().unwrap_or("");
    match next {
        SubscriptionState::Rejected(reason) => info!(
            "event=subscription_state module=gateway status=rejected reason={} subscriber={} type={} selector={}",
            reason.as_str(),
            context.subscriber,
            request.entity_type,
            selector
        ),
        _ => info!(
            "event=subscription_state module=gateway status={} subscriber={} type={} selector={}",
            next.as_str(),
            context.subscriber,
            request.entity_type,
            selector
        ),
    }
    *state = next;
}
