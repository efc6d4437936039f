//! Tenant-based authorization over the entity store.
//!
//! # Invariants
//! - Privileged iff the subscriber row is flagged admin.
//! - Non-privileged access requires the record's tenant to be granted; a
//!   subscriber scoped to an account only sees that account's records.
//! - Lookup failures deny access.

use crate::model::entity::EntityRecord;
use crate::schema::auth::{AuthorizationOracle, SubscriberContext};
use crate::store::entity_store::SqliteEntityStore;
use log::warn;
use std::sync::Arc;

/// Entity type whose records are their own tenant.
pub const DEFAULT_TENANT_TYPE: &str = "Account";

/// `AuthorizationOracle` backed by `subscribers` and `subscriber_accounts`.
pub struct SqliteAccessOracle {
    store: Arc<SqliteEntityStore>,
    tenant_type: String,
}

impl SqliteAccessOracle {
    pub fn new(store: Arc<SqliteEntityStore>) -> Self {
        Self {
            store,
            tenant_type: DEFAULT_TENANT_TYPE.to_string(),
        }
    }

    pub fn with_tenant_type(mut self, entity_type: impl Into<String>) -> Self {
        self.tenant_type = entity_type.into();
        self
    }

    /// Tenant account id of `record`, if any.
    pub fn tenant_of<'a>(&self, record: &'a EntityRecord) -> Option<&'a str> {
        if record.entity_type() == self.tenant_type {
            Some(record.entity_id())
        } else {
            record.account_id.as_deref()
        }
    }
}

impl AuthorizationOracle for SqliteAccessOracle {
    fn is_accessible_by(&self, record: &EntityRecord, context: &SubscriberContext) -> bool {
        if self.is_privileged(context) {
            return true;
        }
        let Some(tenant) = self.tenant_of(record) else {
            return false;
        };
        if let Some(scope) = context.current_account_id.as_deref() {
            if scope != tenant {
                return false;
            }
        }
        match self.store.granted_accounts(context.subscriber.as_str()) {
            Ok(accounts) => accounts.contains(tenant),
            Err(err) => {
                warn!(
                    "event=authorize module=store status=error subscriber={} entity={} error={}",
                    context.subscriber, record.entity, err
                );
                false
            }
        }
    }

    fn is_privileged(&self, context: &SubscriberContext) -> bool {
        match self.store.is_admin(context.subscriber.as_str()) {
            Ok(is_admin) => is_admin,
            Err(err) => {
                warn!(
                    "event=authorize module=store status=error subscriber={} stage=is_admin error={}",
                    context.subscriber, err
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteAccessOracle;
    use crate::model::entity::EntityRecord;
    use crate::schema::auth::{AuthorizationOracle, SubscriberContext};
    use crate::store::entity_store::SqliteEntityStore;
    use std::sync::Arc;

    fn oracle() -> SqliteAccessOracle {
        let store = Arc::new(SqliteEntityStore::open_in_memory().unwrap());
        store.upsert_subscriber("root", true).unwrap();
        store.upsert_subscriber("alice", false).unwrap();
        store.grant_account("alice", "42").unwrap();
        store.grant_account("alice", "43").unwrap();
        SqliteAccessOracle::new(store)
    }

    #[test]
    fn account_is_its_own_tenant() {
        let oracle = oracle();
        let alice = SubscriberContext::new("alice");
        assert!(oracle.is_accessible_by(&EntityRecord::new("Account", "42"), &alice));
        assert!(!oracle.is_accessible_by(&EntityRecord::new("Account", "7"), &alice));
    }

    #[test]
    fn records_follow_their_account() {
        let oracle = oracle();
        let alice = SubscriberContext::new("alice");
        let granted = EntityRecord::new("Membership", "m1").with_account("42");
        let foreign = EntityRecord::new("Membership", "m2").with_account("7");
        let orphan = EntityRecord::new("Membership", "m3");
        assert!(oracle.is_accessible_by(&granted, &alice));
        assert!(!oracle.is_accessible_by(&foreign, &alice));
        assert!(!oracle.is_accessible_by(&orphan, &alice));
    }

    #[test]
    fn scoped_context_narrows_to_current_account() {
        let oracle = oracle();
        let scoped = SubscriberContext::new("alice").scoped_to("43");
        assert!(!oracle.is_accessible_by(&EntityRecord::new("Account", "42"), &scoped));
        assert!(oracle.is_accessible_by(&EntityRecord::new("Account", "43"), &scoped));
    }

    #[test]
    fn admin_is_privileged_and_sees_everything() {
        let oracle = oracle();
        let root = SubscriberContext::new("root");
        assert!(oracle.is_privileged(&root));
        assert!(!oracle.is_privileged(&SubscriberContext::new("alice")));
        assert!(!oracle.is_privileged(&SubscriberContext::new("stranger")));
        assert!(oracle.is_accessible_by(&EntityRecord::new("Account", "7"), &root));
    }
}
