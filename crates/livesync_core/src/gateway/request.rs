//! Subscribe request parsing and outcome types.
//!
//! # Responsibility
//! - Turn raw `(type, selector)` pairs into a typed request.
//! - Define rejection reasons and the subscription state machine.
//!
//! # Invariants
//! - A rejection is terminal for the attempt.
//! - Only `Pending` may move to `Subscribed` or `Rejected`.

use crate::model::channel::ChannelId;
use crate::transport::StreamId;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identity of one accepted subscription.
pub type SubscriptionId = Uuid;

/// Raw inbound subscribe parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub entity_type: String,
    pub selector: Option<String>,
}

impl SubscribeRequest {
    pub fn new(entity_type: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            selector: Some(selector.into()),
        }
    }

    /// Request without a selector; always rejected with `MissingSelector`.
    pub fn without_selector(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            selector: None,
        }
    }

    pub fn from_channel(channel: &ChannelId) -> Self {
        Self::new(channel.entity_type(), channel.selector().to_string())
    }

    /// Validates the request into a channel id.
    pub fn parse(&self) -> Result<ChannelId, RejectReason> {
        let entity_type = self.entity_type.trim();
        let selector = self.selector.as_deref().map(str::trim).unwrap_or_default();
        if entity_type.is_empty() || selector.is_empty() {
            return Err(RejectReason::MissingSelector);
        }
        ChannelId::parse(&format!("{entity_type}:{selector}")).map_err(|_| RejectReason::NotFound)
    }
}

/// Why a subscribe attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    NotFound,
    Unauthorized,
    EmptyCollection,
    MissingSelector,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::EmptyCollection => "empty_collection",
            Self::MissingSelector => "missing_selector",
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscription rejected: {}", self.as_str())
    }
}

impl Error for RejectReason {}

/// Accepted subscription as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Requested channel, e.g. `Chat:9/messages`.
    pub requested: String,
    /// Channels actually streamed; member self-channels for collection requests.
    pub channels: Vec<String>,
    pub streams: Vec<StreamId>,
}

/// Result of one subscribe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed(SubscriptionHandle),
    Rejected(RejectReason),
}

impl SubscribeOutcome {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed(_))
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        match self {
            Self::Subscribed(handle) => Some(handle),
            Self::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            Self::Subscribed(_) => None,
            Self::Rejected(reason) => Some(*reason),
        }
    }
}

/// Lifecycle of one subscription attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Pending,
    Subscribed,
    Rejected(RejectReason),
}

impl SubscriptionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Pending => "pending",
            Self::Subscribed => "subscribed",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Returns whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        matches!(
            (self, next),
            (Self::Unsubscribed, Self::Pending)
                | (Self::Pending, Self::Subscribed)
                | (Self::Pending, Self::Rejected(_))
                | (Self::Subscribed, Self::Unsubscribed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{RejectReason, SubscribeRequest, SubscriptionState};
    use crate::model::channel::ChannelSelector;

    #[test]
    fn missing_or_blank_selector_is_rejected() {
        assert_eq!(
            SubscribeRequest::without_selector("Account").parse(),
            Err(RejectReason::MissingSelector)
        );
        assert_eq!(
            SubscribeRequest::new("Account", "  ").parse(),
            Err(RejectReason::MissingSelector)
        );
        assert_eq!(
            SubscribeRequest::new(" ", "42").parse(),
            Err(RejectReason::MissingSelector)
        );
    }

    #[test]
    fn malformed_selector_cannot_resolve() {
        assert_eq!(
            SubscribeRequest::new("Account", "42/../../etc").parse(),
            Err(RejectReason::NotFound)
        );
        assert_eq!(
            SubscribeRequest::new("account", "42").parse(),
            Err(RejectReason::NotFound)
        );
    }

    #[test]
    fn parses_association_selector() {
        let channel = SubscribeRequest::new("Chat", "9/messages")
            .parse()
            .expect("valid request");
        assert_eq!(
            channel.selector(),
            &ChannelSelector::Association {
                id: "9".to_string(),
                name: "messages".to_string(),
            }
        );
    }

    #[test]
    fn state_machine_allows_only_documented_transitions() {
        use SubscriptionState::*;
        assert!(Unsubscribed.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Subscribed));
        assert!(Pending.can_transition_to(Rejected(RejectReason::NotFound)));
        assert!(Subscribed.can_transition_to(Unsubscribed));

        assert!(!Rejected(RejectReason::NotFound).can_transition_to(Subscribed));
        assert!(!Unsubscribed.can_transition_to(Subscribed));
        assert!(!Subscribed.can_transition_to(Pending));
    }
}
