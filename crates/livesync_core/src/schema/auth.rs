//! Authorization contract for channel subscriptions.

use crate::model::entity::EntityRecord;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Opaque identity of an authenticated subscriber.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberIdentity(pub String);

impl SubscriberIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubscriberIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authorization context attached to one subscribe attempt.
///
/// The session layer fills this in; the gateway only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberContext {
    pub subscriber: SubscriberIdentity,
    /// Tenant the session is currently scoped to, if any.
    pub current_account_id: Option<String>,
}

impl SubscriberContext {
    pub fn new(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: SubscriberIdentity::new(subscriber),
            current_account_id: None,
        }
    }

    pub fn scoped_to(mut self, account_id: impl Into<String>) -> Self {
        self.current_account_id = Some(account_id.into());
        self
    }
}

/// Authorization contract consumed from the domain model.
///
/// Implementations are read-only against durable state.
pub trait AuthorizationOracle: Send + Sync {
    fn is_accessible_by(&self, entity: &EntityRecord, subscriber: &SubscriberContext) -> bool;
    fn is_privileged(&self, subscriber: &SubscriberContext) -> bool;
}
