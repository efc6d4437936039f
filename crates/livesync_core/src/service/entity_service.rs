//! Entity mutation service.
//!
//! # Responsibility
//! - Run create/update/delete against the entity store.
//! - Notify the commit hook once a write has committed.
//!
//! # Invariants
//! - The hook runs only after a successful write, never for a failed one.
//! - Hook behavior cannot fail the mutation.

use crate::broadcast::CommitHook;
use crate::model::entity::{ChangeOperation, EntityRecord, EntityRef};
use crate::store::{EntityLink, SqliteEntityStore, StoreResult};
use log::info;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Input for [`EntityService::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub entity_type: String,
    /// Generated as a v4 uuid when `None`.
    pub entity_id: Option<String>,
    pub account_id: Option<String>,
    pub attributes: Value,
    /// `new.association -> target` edges.
    pub links: Vec<(String, EntityRef)>,
    /// `source.association -> new` edges.
    pub inverse_links: Vec<(EntityRef, String)>,
}

impl NewEntity {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
            account_id: None,
            attributes: Value::Object(Default::default()),
            links: Vec::new(),
            inverse_links: Vec::new(),
        }
    }

    pub fn with_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn in_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn linked_to(mut self, association: impl Into<String>, target: EntityRef) -> Self {
        self.links.push((association.into(), target));
        self
    }

    pub fn member_of(mut self, source: EntityRef, association: impl Into<String>) -> Self {
        self.inverse_links.push((source, association.into()));
        self
    }
}

/// Mutation entry point wired to a post-commit hook.
pub struct EntityService {
    store: Arc<SqliteEntityStore>,
    hook: Arc<dyn CommitHook>,
}

impl EntityService {
    pub fn new(store: Arc<SqliteEntityStore>, hook: Arc<dyn CommitHook>) -> Self {
        Self { store, hook }
    }

    pub fn store(&self) -> &Arc<SqliteEntityStore> {
        &self.store
    }

    /// Inserts an entity with its links, then fires `Create`.
    pub fn create(&self, draft: NewEntity) -> StoreResult<EntityRecord> {
        let entity_id = draft
            .entity_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut record =
            EntityRecord::new(draft.entity_type, entity_id).with_attributes(draft.attributes);
        record.account_id = draft.account_id;

        let outgoing = draft.links.into_iter().map(|(association, target)| {
            EntityLink::new(record.entity.clone(), association, target)
        });
        let incoming = draft.inverse_links.into_iter().map(|(source, association)| {
            EntityLink::new(source, association, record.entity.clone())
        });
        let links: Vec<EntityLink> = outgoing.chain(incoming).collect();

        self.store.insert_entity_with_links(&record, &links)?;
        self.committed(&record, ChangeOperation::Create);
        Ok(record)
    }

    /// Persists new tenant and attributes, then fires `Update`.
    pub fn update(&self, record: &EntityRecord) -> StoreResult<()> {
        self.store.update_entity(record)?;
        self.committed(record, ChangeOperation::Update);
        Ok(())
    }

    /// Soft-deletes, then fires `Delete` with the last known state.
    pub fn delete(&self, entity: &EntityRef) -> StoreResult<EntityRecord> {
        let record = self.store.delete_entity(entity)?;
        self.committed(&record, ChangeOperation::Delete);
        Ok(record)
    }

    fn committed(&self, record: &EntityRecord, operation: ChangeOperation) {
        info!(
            "event=entity_commit module=service status=ok entity={} op={}",
            record.entity,
            operation.as_str()
        );
        self.hook.on_commit(record, operation);
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityService, NewEntity};
    use crate::broadcast::CommitHook;
    use crate::model::entity::{ChangeOperation, EntityRecord, EntityRef};
    use crate::store::{SqliteEntityStore, StoreError};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, ChangeOperation)>>,
    }

    impl CommitHook for RecordingHook {
        fn on_commit(&self, entity: &EntityRecord, operation: ChangeOperation) {
            self.calls
                .lock()
                .unwrap()
                .push((entity.entity.to_string(), operation));
        }
    }

    fn service() -> (EntityService, Arc<RecordingHook>) {
        let store = Arc::new(SqliteEntityStore::open_in_memory().unwrap());
        let hook = Arc::new(RecordingHook::default());
        (EntityService::new(store, hook.clone()), hook)
    }

    #[test]
    fn create_generates_uuid_and_fires_after_write() {
        let (service, hook) = service();
        let record = service.create(NewEntity::new("Account")).unwrap();
        assert!(uuid::Uuid::parse_str(record.entity_id()).is_ok());
        assert!(service.store().get_entity(&record.entity).unwrap().is_some());
        assert_eq!(
            hook.calls.lock().unwrap().clone(),
            vec![(record.entity.to_string(), ChangeOperation::Create)]
        );
    }

    #[test]
    fn failed_write_does_not_fire() {
        let (service, hook) = service();
        service
            .create(NewEntity::new("Account").with_id("1"))
            .unwrap();
        let duplicate = service.create(NewEntity::new("Account").with_id("1"));
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists(_))));
        let missing = service.delete(&EntityRef::new("Account", "2"));
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
        assert_eq!(hook.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn delete_reports_last_state() {
        let (service, hook) = service();
        service.create(NewEntity::new("Account").with_id("42")).unwrap();
        let membership = service
            .create(
                NewEntity::new("Membership")
                    .in_account("42")
                    .linked_to("account", EntityRef::new("Account", "42")),
            )
            .unwrap();

        let deleted = service.delete(&membership.entity).unwrap();
        assert_eq!(deleted.account_id.as_deref(), Some("42"));
        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(calls.last().map(|call| call.1), Some(ChangeOperation::Delete));
    }
}
