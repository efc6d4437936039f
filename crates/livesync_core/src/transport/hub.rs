//! In-process channel hub.
//!
//! # Responsibility
//! - Track which connection streams listen on which channel.
//! - Fan published markers out into per-connection inboxes.
//!
//! # Invariants
//! - A connection receives a marker at most once per broadcast, even when it
//!   holds several streams on the same channel.
//! - Closing a connection closes every stream it owns.
//! - Broadcasting never blocks on consumers; inboxes are drained by the owner.

use crate::model::channel::ChannelId;
use crate::model::marker::{Envelope, Marker};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Identity of one client connection (socket, session, ...).
pub type ConnectionId = Uuid;

/// Identity of one channel stream opened for a connection.
pub type StreamId = Uuid;

pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Unavailable,
    UnknownConnection(ConnectionId),
    UnknownStream(StreamId),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => write!(f, "transport unavailable"),
            Self::UnknownConnection(id) => write!(f, "connection not found: {id}"),
            Self::UnknownStream(id) => write!(f, "stream not found: {id}"),
        }
    }
}

impl Error for TransportError {}

/// Publish-side transport contract.
pub trait MarkerTransport: Send + Sync {
    /// Enqueues `marker` for every listener of its channel.
    ///
    /// Returns the number of connections the marker was queued for.
    fn broadcast(&self, marker: &Marker) -> TransportResult<usize>;
}

#[derive(Debug)]
struct StreamEntry {
    connection: ConnectionId,
    channel_id: String,
}

#[derive(Debug)]
struct HubState {
    available: bool,
    inboxes: HashMap<ConnectionId, VecDeque<Envelope>>,
    streams: HashMap<StreamId, StreamEntry>,
    channels: BTreeMap<String, BTreeSet<StreamId>>,
}

/// Shared in-memory transport.
#[derive(Debug)]
pub struct ChannelHub {
    state: Mutex<HubState>,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                available: true,
                inboxes: HashMap::new(),
                streams: HashMap::new(),
                channels: BTreeMap::new(),
            }),
        }
    }

    /// Registers a new connection with an empty inbox.
    pub fn open_connection(&self) -> ConnectionId {
        let id = Uuid::new_v4();
        self.lock().inboxes.insert(id, VecDeque::new());
        id
    }

    /// Drops a connection, its inbox and every stream it owns.
    ///
    /// Returns the ids of the streams that were closed.
    pub fn close_connection(&self, connection: ConnectionId) -> Vec<StreamId> {
        let mut state = self.lock();
        state.inboxes.remove(&connection);
        let owned: Vec<StreamId> = state
            .streams
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for stream in &owned {
            remove_stream(&mut state, *stream);
        }
        owned
    }

    /// Whether `connection` is open.
    pub fn is_connected(&self, connection: ConnectionId) -> bool {
        self.lock().inboxes.contains_key(&connection)
    }

    /// Opens one stream on `channel` for `connection`.
    pub fn open_stream(
        &self,
        connection: ConnectionId,
        channel: &ChannelId,
    ) -> TransportResult<StreamId> {
        let mut state = self.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }
        if !state.inboxes.contains_key(&connection) {
            return Err(TransportError::UnknownConnection(connection));
        }

        let stream = Uuid::new_v4();
        let channel_id = channel.to_string();
        state
            .channels
            .entry(channel_id.clone())
            .or_default()
            .insert(stream);
        state.streams.insert(
            stream,
            StreamEntry {
                connection,
                channel_id,
            },
        );
        Ok(stream)
    }

    pub fn close_stream(&self, stream: StreamId) -> TransportResult<()> {
        let mut state = self.lock();
        if remove_stream(&mut state, stream) {
            Ok(())
        } else {
            Err(TransportError::UnknownStream(stream))
        }
    }

    /// Queues one envelope for a single connection.
    pub fn deliver(&self, connection: ConnectionId, envelope: Envelope) -> TransportResult<()> {
        let mut state = self.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }
        let inbox = state
            .inboxes
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        inbox.push_back(envelope);
        Ok(())
    }

    /// Takes every queued envelope of one connection, oldest first.
    pub fn drain(&self, connection: ConnectionId) -> Vec<Envelope> {
        self.lock()
            .inboxes
            .get_mut(&connection)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Simulates transport outages; while unavailable every send fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// Number of open streams listening on `channel_id`.
    pub fn listener_count(&self, channel_id: &str) -> usize {
        self.lock()
            .channels
            .get(channel_id)
            .map_or(0, BTreeSet::len)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MarkerTransport for ChannelHub {
    fn broadcast(&self, marker: &Marker) -> TransportResult<usize> {
        let mut state = self.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }

        let targets: BTreeSet<ConnectionId> = match state.channels.get(&marker.channel_id) {
            Some(streams) => streams
                .iter()
                .filter_map(|stream| state.streams.get(stream))
                .map(|entry| entry.connection)
                .collect(),
            None => BTreeSet::new(),
        };

        let mut delivered = 0;
        for connection in targets {
            if let Some(inbox) = state.inboxes.get_mut(&connection) {
                inbox.push_back(Envelope::Marker(marker.clone()));
                delivered += 1;
            }
        }
        debug!(
            "event=hub_broadcast module=transport status=ok channel={} action={} connections={}",
            marker.channel_id,
            marker.action.as_str(),
            delivered
        );
        Ok(delivered)
    }
}

fn remove_stream(state: &mut HubState, stream: StreamId) -> bool {
    let Some(entry) = state.streams.remove(&stream) else {
        return false;
    };
    if let Some(listeners) = state.channels.get_mut(&entry.channel_id) {
        listeners.remove(&stream);
        if listeners.is_empty() {
            state.channels.remove(&entry.channel_id);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{ChannelHub, MarkerTransport, TransportError};
    use crate::model::channel::ChannelId;
    use crate::model::marker::{Envelope, Marker};

    fn channel(value: &str) -> ChannelId {
        ChannelId::parse(value).expect("valid channel")
    }

    #[test]
    fn broadcast_reaches_only_listeners_of_the_channel() {
        let hub = ChannelHub::new();
        let listener = hub.open_connection();
        let bystander = hub.open_connection();
        hub.open_stream(listener, &channel("Account:42"))
            .expect("stream opens");
        hub.open_stream(bystander, &channel("Account:7"))
            .expect("stream opens");

        let delivered = hub
            .broadcast(&Marker::refresh(&channel("Account:42"), "account"))
            .expect("broadcast");
        assert_eq!(delivered, 1);
        assert_eq!(hub.drain(listener).len(), 1);
        assert!(hub.drain(bystander).is_empty());
    }

    #[test]
    fn duplicate_streams_on_one_connection_deliver_once() {
        let hub = ChannelHub::new();
        let connection = hub.open_connection();
        hub.open_stream(connection, &channel("Account:42"))
            .expect("first stream");
        hub.open_stream(connection, &channel("Account:42"))
            .expect("second stream");
        assert_eq!(hub.listener_count("Account:42"), 2);

        hub.broadcast(&Marker::refresh(&channel("Account:42"), "account"))
            .expect("broadcast");
        assert_eq!(hub.drain(connection).len(), 1);
    }

    #[test]
    fn closing_connection_closes_its_streams() {
        let hub = ChannelHub::new();
        let connection = hub.open_connection();
        let stream = hub
            .open_stream(connection, &channel("Account:all"))
            .expect("stream opens");

        assert!(hub.is_connected(connection));
        let closed = hub.close_connection(connection);
        assert_eq!(closed, vec![stream]);
        assert!(!hub.is_connected(connection));
        assert_eq!(hub.stream_count(), 0);
        assert_eq!(hub.listener_count("Account:all"), 0);
        assert_eq!(
            hub.close_stream(stream),
            Err(TransportError::UnknownStream(stream))
        );
    }

    #[test]
    fn unavailable_transport_rejects_sends() {
        let hub = ChannelHub::new();
        let connection = hub.open_connection();
        hub.set_available(false);

        let marker = Marker::refresh(&channel("Account:1"), "account");
        assert_eq!(hub.broadcast(&marker), Err(TransportError::Unavailable));
        assert_eq!(
            hub.deliver(connection, Envelope::Marker(marker)),
            Err(TransportError::Unavailable)
        );
        assert_eq!(
            hub.open_stream(connection, &channel("Account:1")),
            Err(TransportError::Unavailable)
        );
    }
}
