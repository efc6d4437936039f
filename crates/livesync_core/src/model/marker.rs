//! Marker wire payload and connection envelopes.
//!
//! # Responsibility
//! - Define the minimal broadcast payload: which channel, what to do, which prop.
//! - Provide the JSON wire codec.
//!
//! # Invariants
//! - A marker never carries entity state; clients always re-fetch.
//! - Wire JSON has exactly the keys `channel_id`, `action`, `prop`.

use crate::model::channel::ChannelId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

/// What a receiver should do with the named prop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerAction {
    Refresh,
    Remove,
}

impl MarkerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Remove => "remove",
        }
    }
}

/// Broadcast payload for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker {
    pub channel_id: String,
    pub action: MarkerAction,
    pub prop: String,
}

impl Marker {
    pub fn new(channel: &ChannelId, action: MarkerAction, prop: impl Into<String>) -> Self {
        Self {
            channel_id: channel.to_string(),
            action,
            prop: prop.into(),
        }
    }

    pub fn refresh(channel: &ChannelId, prop: impl Into<String>) -> Self {
        Self::new(channel, MarkerAction::Refresh, prop)
    }

    pub fn remove(channel: &ChannelId, prop: impl Into<String>) -> Self {
        Self::new(channel, MarkerAction::Remove, prop)
    }

    /// Encodes this marker as wire JSON.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes one marker from wire JSON.
    pub fn from_wire(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.channel_id,
            self.action.as_str(),
            self.prop
        )
    }
}

/// Item delivered into one connection inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Marker(Marker),
    /// One-off state push for live types right after subscribe.
    Snapshot { channel_id: String, state: Value },
}

impl Envelope {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Marker(marker) => marker.channel_id.as_str(),
            Self::Snapshot { channel_id, .. } => channel_id.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Marker, MarkerAction};
    use crate::model::channel::ChannelId;
    use serde_json::json;

    #[test]
    fn wire_payload_uses_lowercase_actions() {
        let channel = ChannelId::parse("Account:42").expect("valid channel");
        let wire = Marker::remove(&channel, "account")
            .to_wire()
            .expect("marker should encode");
        let value: serde_json::Value = serde_json::from_str(&wire).expect("valid json");
        assert_eq!(
            value,
            json!({"channel_id": "Account:42", "action": "remove", "prop": "account"})
        );
    }

    #[test]
    fn decodes_wire_payload_and_rejects_unknown_action() {
        let marker =
            Marker::from_wire(r#"{"channel_id":"Account:all","action":"refresh","prop":"accounts"}"#)
                .expect("marker should decode");
        assert_eq!(marker.action, MarkerAction::Refresh);
        assert_eq!(marker.prop, "accounts");

        assert!(
            Marker::from_wire(r#"{"channel_id":"Account:all","action":"splice","prop":"x"}"#)
                .is_err()
        );
    }
}
