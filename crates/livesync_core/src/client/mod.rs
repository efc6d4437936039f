//! Client-side subscription registry.
//!
//! # Responsibility
//! - Keep UI components subscribed to the channels they render.
//! - Turn marker bursts into one consolidated refresh per window.
//!
//! # See also
//! - `gateway` for the server end of `GatewayClientTransport`.

pub mod connection;
pub mod debounce;
pub mod registry;

pub use connection::{ClientConnection, GatewayClientTransport};
pub use debounce::{DebounceState, ReconcilerConfig, DEFAULT_DEBOUNCE_WINDOW_MS};
pub use registry::{
    ChannelSubscription, ClientRegistry, ClientSubscribeError, ClientSubscriptionEntry,
    ClientTransport, DesiredChannels, PropNames, RefreshHost,
};
