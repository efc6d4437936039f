//! Client subscription registry and debounced reconciler.
//!
//! # Responsibility
//! - Keep the desired `channel -> prop names` mapping of one UI component
//!   subscribed on the transport.
//! - Diff desired mappings on update without resubscription churn.
//! - Coalesce inbound markers into one refresh call per debounce window.
//!
//! # Invariants
//! - One debounce state per registry, shared by every channel.
//! - Channels kept across `update` keep their handle (`Rc::ptr_eq`).
//! - Malformed channel ids are logged and skipped; siblings still subscribe.
//! - `teardown` unsubscribes everything and discards the pending batch.
//! - Single-threaded: every method runs on the owning event loop.

use crate::client::debounce::{DebounceState, ReconcilerConfig};
use crate::gateway::RejectReason;
use crate::model::channel::ChannelId;
use crate::model::marker::{Envelope, Marker};
use crate::transport::TransportError;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::rc::Rc;
use uuid::Uuid;

/// One or many prop names for a desired channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropNames(BTreeSet<String>);

impl PropNames {
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn into_set(self) -> BTreeSet<String> {
        self.0
    }
}

impl From<&str> for PropNames {
    fn from(value: &str) -> Self {
        Self(BTreeSet::from([value.to_string()]))
    }
}

impl From<String> for PropNames {
    fn from(value: String) -> Self {
        Self(BTreeSet::from([value]))
    }
}

impl From<Vec<String>> for PropNames {
    fn from(value: Vec<String>) -> Self {
        Self(value.into_iter().collect())
    }
}

impl<const N: usize> From<[&str; N]> for PropNames {
    fn from(value: [&str; N]) -> Self {
        Self(value.iter().map(|prop| prop.to_string()).collect())
    }
}

/// Desired `channel id -> prop names` mapping handed to `register`/`update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredChannels(BTreeMap<String, PropNames>);

impl DesiredChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel_id: impl Into<String>, props: impl Into<PropNames>) -> Self {
        self.insert(channel_id, props);
        self
    }

    pub fn insert(&mut self, channel_id: impl Into<String>, props: impl Into<PropNames>) {
        self.0.insert(channel_id.into(), props.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for DesiredChannels
where
    K: Into<String>,
    V: Into<PropNames>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut desired = Self::new();
        for (channel_id, props) in iter {
            desired.insert(channel_id, props);
        }
        desired
    }
}

/// Transport-side handle of one client channel subscription.
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub requested: ChannelId,
    /// Channels markers arrive on; member self-channels for `Type:id/assoc`.
    pub streamed: BTreeSet<String>,
    pub token: Uuid,
}

impl ChannelSubscription {
    /// Subscription streaming exactly the requested channel.
    pub fn direct(requested: ChannelId) -> Self {
        let streamed = BTreeSet::from([requested.to_string()]);
        Self {
            requested,
            streamed,
            token: Uuid::new_v4(),
        }
    }

    pub fn covers(&self, channel_id: &str) -> bool {
        self.streamed.contains(channel_id)
    }
}

/// Why the transport refused a client subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSubscribeError {
    Rejected(RejectReason),
    Transport(TransportError),
}

impl Display for ClientSubscribeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "{reason}"),
            Self::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ClientSubscribeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rejected(reason) => Some(reason),
            Self::Transport(err) => Some(err),
        }
    }
}

impl From<RejectReason> for ClientSubscribeError {
    fn from(value: RejectReason) -> Self {
        Self::Rejected(value)
    }
}

impl From<TransportError> for ClientSubscribeError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// Client view of the channel transport.
pub trait ClientTransport {
    fn subscribe(&mut self, channel: &ChannelId)
        -> Result<ChannelSubscription, ClientSubscribeError>;
    fn unsubscribe(&mut self, subscription: &ChannelSubscription);
}

/// Host application callbacks.
pub trait RefreshHost {
    /// Re-fetches the named props from the authoritative source.
    fn refresh(&mut self, props: &BTreeSet<String>);

    /// Applies a live-type snapshot pushed right after subscribe.
    fn apply_snapshot(&mut self, _channel_id: &str, _state: &Value) {}
}

/// Registry state for one desired channel.
#[derive(Debug)]
pub struct ClientSubscriptionEntry {
    pub channel: ChannelId,
    pub prop_names: BTreeSet<String>,
    handle: Option<Rc<ChannelSubscription>>,
}

impl ClientSubscriptionEntry {
    /// `None` when the transport refused the subscription.
    pub fn handle(&self) -> Option<&Rc<ChannelSubscription>> {
        self.handle.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

/// Registry of one UI component's live channels.
pub struct ClientRegistry<T: ClientTransport, H: RefreshHost> {
    transport: T,
    host: H,
    config: ReconcilerConfig,
    entries: BTreeMap<String, ClientSubscriptionEntry>,
    debounce: DebounceState,
    torn_down: bool,
}

impl<T: ClientTransport, H: RefreshHost> ClientRegistry<T, H> {
    /// Subscribes every well-formed channel of `desired`.
    pub fn register(
        transport: T,
        host: H,
        desired: DesiredChannels,
        config: ReconcilerConfig,
    ) -> Self {
        let mut registry = Self {
            transport,
            host,
            config,
            entries: BTreeMap::new(),
            debounce: DebounceState::Idle,
            torn_down: false,
        };
        for (_, (channel, props)) in normalize(desired) {
            registry.add_entry(channel, props);
        }
        info!(
            "event=client_register module=client status=ok channels={} active={}",
            registry.entries.len(),
            registry.active_channels().len()
        );
        registry
    }

    /// Replaces the desired mapping, subscribing and unsubscribing the diff.
    ///
    /// Channels present before and after keep their subscription handle and
    /// only take over the new prop names. A pending batch is kept.
    pub fn update(&mut self, desired: DesiredChannels) {
        if self.torn_down {
            warn!("event=client_update module=client status=skip reason=torn_down");
            return;
        }
        let next = normalize(desired);

        let removed: Vec<String> = self
            .entries
            .keys()
            .filter(|key| !next.contains_key(*key))
            .cloned()
            .collect();
        for key in &removed {
            if let Some(entry) = self.entries.remove(key) {
                self.release(&entry);
            }
        }

        let mut added = 0;
        for (key, (channel, props)) in next {
            match self.entries.get_mut(&key) {
                Some(entry) => entry.prop_names = props,
                None => {
                    self.add_entry(channel, props);
                    added += 1;
                }
            }
        }

        info!(
            "event=client_update module=client status=ok added={} removed={} channels={}",
            added,
            removed.len(),
            self.entries.len()
        );
    }

    /// Unsubscribes every channel and drops any pending batch unflushed.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        let entries = std::mem::take(&mut self.entries);
        for entry in entries.values() {
            self.release(entry);
        }
        let discarded = self
            .debounce
            .pending_props()
            .map_or(0, BTreeSet::len);
        self.debounce = DebounceState::Idle;
        self.torn_down = true;
        info!(
            "event=client_teardown module=client status=ok channels={} discarded_props={}",
            entries.len(),
            discarded
        );
    }

    /// Feeds one inbound marker received at `now_ms`.
    ///
    /// Returns whether the marker matched an active channel.
    pub fn handle_marker(&mut self, marker: &Marker, now_ms: u64) -> bool {
        if self.torn_down {
            return false;
        }
        let props: BTreeSet<String> = self
            .entries
            .values()
            .filter(|entry| {
                entry
                    .handle
                    .as_ref()
                    .is_some_and(|handle| handle.covers(&marker.channel_id))
            })
            .flat_map(|entry| entry.prop_names.iter().cloned())
            .collect();
        if props.is_empty() {
            debug!(
                "event=client_marker module=client status=ignored channel={}",
                marker.channel_id
            );
            return false;
        }

        let state = std::mem::take(&mut self.debounce);
        self.debounce = state.on_marker(props, now_ms, self.config.debounce_window_ms);
        true
    }

    /// Dispatches one connection envelope.
    pub fn handle_envelope(&mut self, envelope: &Envelope, now_ms: u64) -> bool {
        match envelope {
            Envelope::Marker(marker) => self.handle_marker(marker, now_ms),
            Envelope::Snapshot { channel_id, state } => {
                let active = self
                    .entries
                    .get(channel_id)
                    .is_some_and(ClientSubscriptionEntry::is_active);
                if self.torn_down || !active {
                    return false;
                }
                self.host.apply_snapshot(channel_id, state);
                true
            }
        }
    }

    /// Timer callback: flushes the batch when its deadline has passed.
    ///
    /// Returns whether a refresh was issued.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        let state = std::mem::take(&mut self.debounce);
        let (state, flushed) = state.on_timer(now_ms);
        self.debounce = state;
        match flushed {
            Some(props) => {
                debug!(
                    "event=client_refresh module=client status=ok props={}",
                    props.iter().cloned().collect::<Vec<_>>().join(",")
                );
                self.host.refresh(&props);
                true
            }
            None => false,
        }
    }

    /// When the event loop should call [`ClientRegistry::tick`] next.
    pub fn next_deadline(&self) -> Option<u64> {
        self.debounce.deadline_ms()
    }

    pub fn pending_props(&self) -> Option<&BTreeSet<String>> {
        self.debounce.pending_props()
    }

    pub fn entry(&self, channel_id: &str) -> Option<&ClientSubscriptionEntry> {
        self.entries.get(channel_id)
    }

    /// Subscription handle of one channel, if active.
    pub fn handle(&self, channel_id: &str) -> Option<Rc<ChannelSubscription>> {
        self.entries
            .get(channel_id)
            .and_then(|entry| entry.handle.clone())
    }

    /// Channels with a live transport subscription, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn add_entry(&mut self, channel: ChannelId, prop_names: BTreeSet<String>) {
        let key = channel.to_string();
        let handle = match self.transport.subscribe(&channel) {
            Ok(subscription) => Some(Rc::new(subscription)),
            Err(err) => {
                warn!(
                    "event=client_subscribe module=client status=error channel={} error={}",
                    key, err
                );
                None
            }
        };
        self.entries.insert(
            key,
            ClientSubscriptionEntry {
                channel,
                prop_names,
                handle,
            },
        );
    }

    fn release(&mut self, entry: &ClientSubscriptionEntry) {
        if let Some(handle) = &entry.handle {
            self.transport.unsubscribe(handle);
        }
    }
}

/// Parses desired channel ids, dropping malformed ones and empty prop sets.
fn normalize(desired: DesiredChannels) -> BTreeMap<String, (ChannelId, BTreeSet<String>)> {
    let mut out = BTreeMap::new();
    for (raw, props) in desired.0 {
        let channel = match ChannelId::parse(&raw) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    "event=client_register module=client status=skip reason=malformed_channel_id error={}",
                    err
                );
                continue;
            }
        };
        let props: BTreeSet<String> = props
            .into_set()
            .into_iter()
            .map(|prop| prop.trim().to_string())
            .filter(|prop| !prop.is_empty())
            .collect();
        if props.is_empty() {
            warn!(
                "event=client_register module=client status=skip reason=no_props channel={}",
                channel
            );
            continue;
        }
        out.insert(channel.to_string(), (channel, props));
    }
    out
}
