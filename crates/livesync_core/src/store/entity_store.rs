//! SQLite-backed entity store.
//!
//! # Responsibility
//! - Persist entities, association links and subscriber grants.
//! - Serve entity lookups, association resolution and live snapshots to the
//!   broadcast subsystem.
//!
//! # Invariants
//! - Deletes are soft (`is_deleted = 1`); links of a deleted entity survive so
//!   its delete can still fan out to former peers.
//! - Reads and association resolution never return deleted entities.
//! - Association resolution follows the storage the schema declares: link rows,
//!   the tenant column, or the inverse side of either.
//! - Entity type and id must form a valid `Type:id` channel id.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::channel::{ChannelId, ChannelSelector};
use crate::model::entity::{EntityRecord, EntityRef};
use crate::schema::reflect::{AssociationDescriptor, AssociationStorage};
use crate::schema::resolve::{EntityResolver, ResolveError, ResolveResult, SnapshotSource};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const ENTITY_SELECT_SQL: &str = "SELECT
    entity_type,
    entity_id,
    account_id,
    attributes
FROM entities";

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors of the reference persistence adapter.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    InvalidEntity(String),
    NotFound(EntityRef),
    AlreadyExists(EntityRef),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidEntity(message) => write!(f, "invalid entity: {message}"),
            Self::NotFound(entity) => write!(f, "entity not found: {entity}"),
            Self::AlreadyExists(entity) => write!(f, "entity already exists: {entity}"),
            Self::InvalidData(message) => write!(f, "invalid persisted entity data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidEntity(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Directed association edge `source.association -> target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLink {
    pub source: EntityRef,
    pub association: String,
    pub target: EntityRef,
}

impl EntityLink {
    pub fn new(source: EntityRef, association: impl Into<String>, target: EntityRef) -> Self {
        Self {
            source,
            association: association.into(),
            target,
        }
    }
}

/// Entity store over one SQLite connection.
pub struct SqliteEntityStore {
    conn: Mutex<Connection>,
}

impl SqliteEntityStore {
    /// Wraps a connection returned by `open_db`/`open_db_in_memory`.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(open_db_in_memory()?))
    }

    /// Inserts a new live entity.
    ///
    /// # Errors
    /// - `AlreadyExists` when a row (live or deleted) holds the same ref.
    pub fn insert_entity(&self, record: &EntityRecord) -> StoreResult<()> {
        self.insert_entity_with_links(record, &[])
    }

    /// Inserts an entity and its links in one transaction.
    pub fn insert_entity_with_links(
        &self,
        record: &EntityRecord,
        links: &[EntityLink],
    ) -> StoreResult<()> {
        validate_ref(&record.entity)?;
        for link in links {
            validate_link(link)?;
        }
        let attributes = encode_attributes(&record.attributes)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM entities WHERE entity_type = ?1 AND entity_id = ?2
            );",
            params![record.entity_type(), record.entity_id()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::AlreadyExists(record.entity.clone()));
        }

        tx.execute(
            "INSERT INTO entities (entity_type, entity_id, account_id, attributes)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                record.entity_type(),
                record.entity_id(),
                record.account_id.as_deref(),
                attributes,
            ],
        )?;
        for link in links {
            insert_link(&tx, link)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces tenant and attributes of a live entity.
    pub fn update_entity(&self, record: &EntityRecord) -> StoreResult<()> {
        let attributes = encode_attributes(&record.attributes)?;
        let changed = self.lock().execute(
            "UPDATE entities
             SET
                account_id = ?1,
                attributes = ?2,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE entity_type = ?3
               AND entity_id = ?4
               AND is_deleted = 0;",
            params![
                record.account_id.as_deref(),
                attributes,
                record.entity_type(),
                record.entity_id(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(record.entity.clone()));
        }
        Ok(())
    }

    /// Soft-deletes a live entity and returns its last state.
    pub fn delete_entity(&self, entity: &EntityRef) -> StoreResult<EntityRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let record =
            query_live(&tx, entity)?.ok_or_else(|| StoreError::NotFound(entity.clone()))?;
        tx.execute(
            "UPDATE entities
             SET is_deleted = 1, updated_at = (strftime('%s', 'now') * 1000)
             WHERE entity_type = ?1 AND entity_id = ?2;",
            params![entity.entity_type, entity.entity_id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Live entity by ref.
    pub fn get_entity(&self, entity: &EntityRef) -> StoreResult<Option<EntityRecord>> {
        query_live(&self.lock(), entity)
    }

    /// Adds one directed link; linking twice is a no-op.
    pub fn link(&self, link: &EntityLink) -> StoreResult<()> {
        validate_link(link)?;
        insert_link(&self.lock(), link)
    }

    /// Removes one directed link. Returns whether it existed.
    pub fn unlink(&self, link: &EntityLink) -> StoreResult<bool> {
        let removed = self.lock().execute(
            "DELETE FROM entity_links
             WHERE source_type = ?1
               AND source_id = ?2
               AND association = ?3
               AND target_type = ?4
               AND target_id = ?5;",
            params![
                link.source.entity_type,
                link.source.entity_id,
                link.association,
                link.target.entity_type,
                link.target.entity_id,
            ],
        )?;
        Ok(removed > 0)
    }

    /// Live targets of `source.association`, ordered by type then id.
    pub fn linked(&self, source: &EntityRef, association: &str) -> StoreResult<Vec<EntityRef>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT l.target_type, l.target_id
             FROM entity_links l
             JOIN entities e
               ON e.entity_type = l.target_type
              AND e.entity_id = l.target_id
             WHERE l.source_type = ?1
               AND l.source_id = ?2
               AND l.association = ?3
               AND e.is_deleted = 0
             ORDER BY l.target_type ASC, l.target_id ASC;",
        )?;
        let rows = stmt.query_map(
            params![source.entity_type, source.entity_id, association],
            |row| Ok(EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }

    /// Live sources of type `source_type` whose `association` points at `target`.
    pub fn linked_from(
        &self,
        target: &EntityRef,
        source_type: &str,
        association: &str,
    ) -> StoreResult<Vec<EntityRef>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT l.source_type, l.source_id
             FROM entity_links l
             JOIN entities e
               ON e.entity_type = l.source_type
              AND e.entity_id = l.source_id
             WHERE l.target_type = ?1
               AND l.target_id = ?2
               AND l.association = ?3
               AND l.source_type = ?4
               AND e.is_deleted = 0
             ORDER BY l.source_type ASC, l.source_id ASC;",
        )?;
        let rows = stmt.query_map(
            params![target.entity_type, target.entity_id, association, source_type],
            |row| Ok(EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut sources = Vec::new();
        for row in rows {
            sources.push(row?);
        }
        Ok(sources)
    }

    /// Live entities of `entity_type` whose tenant column is `account_id`.
    pub fn tenant_members(
        &self,
        entity_type: &str,
        account_id: &str,
    ) -> StoreResult<Vec<EntityRef>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id
             FROM entities
             WHERE entity_type = ?1
               AND account_id = ?2
               AND is_deleted = 0
             ORDER BY entity_id ASC;",
        )?;
        let rows = stmt.query_map(params![entity_type, account_id], |row| {
            Ok(EntityRef::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Live records behind `owner.association`, ordered by type then id.
    pub fn associated(
        &self,
        owner: &EntityRecord,
        association: &AssociationDescriptor,
    ) -> StoreResult<Vec<EntityRef>> {
        match &association.storage {
            AssociationStorage::Link => self.linked(&owner.entity, &association.name),
            AssociationStorage::TenantColumn => {
                let Some(account_id) = owner.account_id.as_deref() else {
                    return Ok(Vec::new());
                };
                let tenant = EntityRef::new(association.target_type.clone(), account_id);
                let live = self.get_entity(&tenant)?.is_some();
                Ok(if live { vec![tenant] } else { Vec::new() })
            }
            AssociationStorage::InverseLink(inverse) => {
                let mut members = self.linked(&owner.entity, &association.name)?;
                members.extend(self.linked_from(
                    &owner.entity,
                    &association.target_type,
                    inverse,
                )?);
                members.sort();
                members.dedup();
                Ok(members)
            }
            AssociationStorage::InverseTenantColumn => {
                self.tenant_members(&association.target_type, owner.entity_id())
            }
        }
    }

    /// Creates or updates a subscriber's admin flag.
    pub fn upsert_subscriber(&self, subscriber_id: &str, is_admin: bool) -> StoreResult<()> {
        let subscriber_id = subscriber_id.trim();
        if subscriber_id.is_empty() {
            return Err(StoreError::InvalidEntity(
                "subscriber id cannot be empty".to_string(),
            ));
        }
        self.lock().execute(
            "INSERT INTO subscribers (subscriber_id, is_admin)
             VALUES (?1, ?2)
             ON CONFLICT (subscriber_id) DO UPDATE SET is_admin = excluded.is_admin;",
            params![subscriber_id, bool_to_int(is_admin)],
        )?;
        Ok(())
    }

    /// Grants a subscriber access to one tenant account.
    pub fn grant_account(&self, subscriber_id: &str, account_id: &str) -> StoreResult<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO subscriber_accounts (subscriber_id, account_id)
             VALUES (?1, ?2);",
            params![subscriber_id, account_id],
        )?;
        Ok(())
    }

    /// Returns `false` for unknown subscribers.
    pub fn is_admin(&self, subscriber_id: &str) -> StoreResult<bool> {
        let flag: Option<i64> = self
            .lock()
            .query_row(
                "SELECT is_admin FROM subscribers WHERE subscriber_id = ?1;",
                [subscriber_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag == Some(1))
    }

    pub fn granted_accounts(&self, subscriber_id: &str) -> StoreResult<BTreeSet<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id FROM subscriber_accounts WHERE subscriber_id = ?1;",
        )?;
        let rows = stmt.query_map([subscriber_id], |row| row.get::<_, String>(0))?;
        let mut accounts = BTreeSet::new();
        for row in rows {
            accounts.insert(row?);
        }
        Ok(accounts)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntityResolver for SqliteEntityStore {
    fn find(&self, entity: &EntityRef) -> ResolveResult<Option<EntityRecord>> {
        self.get_entity(entity)
            .map_err(|err| ResolveError::new(entity, err.to_string()))
    }

    fn resolve_singular(
        &self,
        owner: &EntityRecord,
        association: &AssociationDescriptor,
    ) -> ResolveResult<Option<EntityRef>> {
        let mut targets = self
            .associated(owner, association)
            .map_err(|err| ResolveError::new(&owner.entity, err.to_string()))?;
        if targets.len() > 1 {
            warn!(
                "event=resolve_singular module=store status=ambiguous entity={} association={} targets={}",
                owner.entity,
                association.name,
                targets.len()
            );
        }
        Ok((!targets.is_empty()).then(|| targets.remove(0)))
    }

    fn resolve_collection(
        &self,
        owner: &EntityRecord,
        association: &AssociationDescriptor,
    ) -> ResolveResult<Vec<EntityRef>> {
        self.associated(owner, association)
            .map_err(|err| ResolveError::new(&owner.entity, err.to_string()))
    }
}

impl SnapshotSource for SqliteEntityStore {
    fn snapshot(&self, record: &EntityRecord) -> Option<Value> {
        match self.get_entity(&record.entity) {
            Ok(Some(current)) => Some(json!({
                "entity_type": current.entity_type(),
                "entity_id": current.entity_id(),
                "account_id": current.account_id,
                "attributes": current.attributes,
            })),
            Ok(None) => None,
            Err(err) => {
                debug!(
                    "event=snapshot module=store status=error entity={} error={}",
                    record.entity, err
                );
                None
            }
        }
    }
}

fn query_live(conn: &Connection, entity: &EntityRef) -> StoreResult<Option<EntityRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{ENTITY_SELECT_SQL}
         WHERE entity_type = ?1
           AND entity_id = ?2
           AND is_deleted = 0;"
    ))?;
    let mut rows = stmt.query(params![entity.entity_type, entity.entity_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_entity_row(row)?)),
        None => Ok(None),
    }
}

fn insert_link(conn: &Connection, link: &EntityLink) -> StoreResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO entity_links (
            source_type,
            source_id,
            association,
            target_type,
            target_id
        ) VALUES (?1, ?2, ?3, ?4, ?5);",
        params![
            link.source.entity_type,
            link.source.entity_id,
            link.association,
            link.target.entity_type,
            link.target.entity_id,
        ],
    )?;
    Ok(())
}

fn parse_entity_row(row: &Row<'_>) -> StoreResult<EntityRecord> {
    let entity_type: String = row.get(0)?;
    let entity_id: String = row.get(1)?;
    let account_id: Option<String> = row.get(2)?;
    let raw_attributes: String = row.get(3)?;
    let attributes = serde_json::from_str(&raw_attributes).map_err(|err| {
        StoreError::InvalidData(format!(
            "attributes of {entity_type}:{entity_id} are not JSON: {err}"
        ))
    })?;

    Ok(EntityRecord {
        entity: EntityRef::new(entity_type, entity_id),
        account_id,
        attributes,
    })
}

fn validate_ref(entity: &EntityRef) -> StoreResult<()> {
    let channel = ChannelId::parse(&entity.to_string())
        .map_err(|err| StoreError::InvalidEntity(err.to_string()))?;
    match channel.selector() {
        ChannelSelector::Id(_) => Ok(()),
        _ => Err(StoreError::InvalidEntity(format!(
            "`{entity}` does not name a single record"
        ))),
    }
}

fn validate_link(link: &EntityLink) -> StoreResult<()> {
    validate_ref(&link.source)?;
    validate_ref(&link.target)?;
    if link.association.trim().is_empty() {
        return Err(StoreError::InvalidEntity(
            "association name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn encode_attributes(attributes: &Value) -> StoreResult<String> {
    serde_json::to_string(attributes)
        .map_err(|err| StoreError::InvalidEntity(format!("attributes are not serializable: {err}")))
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityLink, SqliteEntityStore, StoreError};
    use crate::model::entity::{EntityRecord, EntityRef};
    use crate::schema::reflect::{AssociationDescriptor, AssociationReflector, ModelSchema};
    use crate::schema::resolve::{EntityResolver, SnapshotSource};
    use serde_json::json;

    fn store() -> SqliteEntityStore {
        SqliteEntityStore::open_in_memory().expect("in-memory store")
    }

    fn association(entity_type: &str, name: &str) -> AssociationDescriptor {
        ModelSchema::new()
            .belongs_to_tenant("Membership", "account", "Account")
            .has_many("Account", "memberships", "Membership")
            .inverse_of("Account", "memberships", "account")
            .belongs_to("Message", "chat", "Chat")
            .belongs_to("Membership", "inviter", "User")
            .has_many("Chat", "messages", "Message")
            .inverse_of("Chat", "messages", "chat")
            .has_many("Chat", "pins", "Message")
            .reflect_association(entity_type, name)
            .expect("declared association")
    }

    #[test]
    fn insert_rejects_invalid_refs_and_duplicates() {
        let store = store();
        let bad = EntityRecord::new("account", "1");
        assert!(matches!(
            store.insert_entity(&bad),
            Err(StoreError::InvalidEntity(_))
        ));
        let all = EntityRecord::new("Account", "all");
        assert!(matches!(
            store.insert_entity(&all),
            Err(StoreError::InvalidEntity(_))
        ));

        let account = EntityRecord::new("Account", "1");
        store.insert_entity(&account).unwrap();
        assert!(matches!(
            store.insert_entity(&account),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn soft_delete_hides_entity_but_keeps_its_links() {
        let store = store();
        let user = EntityRef::new("User", "u1");
        let membership = EntityRef::new("Membership", "m1");
        store.insert_entity(&EntityRecord::new("User", "u1")).unwrap();
        store
            .insert_entity_with_links(
                &EntityRecord::new("Membership", "m1").with_account("42"),
                &[EntityLink::new(membership.clone(), "inviter", user.clone())],
            )
            .unwrap();

        let deleted = store.delete_entity(&membership).unwrap();
        assert_eq!(deleted.account_id.as_deref(), Some("42"));
        assert_eq!(store.find(&membership).unwrap(), None);
        assert_eq!(
            store
                .resolve_singular(&deleted, &association("Membership", "inviter"))
                .unwrap(),
            Some(user)
        );
        assert!(matches!(
            store.delete_entity(&membership),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn collection_resolution_skips_deleted_members() {
        let store = store();
        let chat = EntityRecord::new("Chat", "9");
        store.insert_entity(&chat).unwrap();
        for id in ["a", "b"] {
            let message = EntityRef::new("Message", id);
            store
                .insert_entity_with_links(
                    &EntityRecord::new("Message", id),
                    &[EntityLink::new(chat.entity.clone(), "pins", message)],
                )
                .unwrap();
        }
        store.delete_entity(&EntityRef::new("Message", "a")).unwrap();

        assert_eq!(
            store
                .resolve_collection(&chat, &association("Chat", "pins"))
                .unwrap(),
            vec![EntityRef::new("Message", "b")]
        );
        assert!(store
            .resolve_collection(&chat, &association("Chat", "messages"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn has_many_reads_links_written_on_the_belongs_to_side() {
        let store = store();
        let chat = EntityRecord::new("Chat", "9");
        store.insert_entity(&chat).unwrap();
        store
            .insert_entity_with_links(
                &EntityRecord::new("Message", "a"),
                &[EntityLink::new(
                    EntityRef::new("Message", "a"),
                    "chat",
                    chat.entity.clone(),
                )],
            )
            .unwrap();
        store
            .insert_entity_with_links(
                &EntityRecord::new("Message", "b"),
                &[EntityLink::new(
                    chat.entity.clone(),
                    "messages",
                    EntityRef::new("Message", "b"),
                )],
            )
            .unwrap();

        assert_eq!(
            store
                .resolve_collection(&chat, &association("Chat", "messages"))
                .unwrap(),
            vec![EntityRef::new("Message", "a"), EntityRef::new("Message", "b")]
        );
    }

    #[test]
    fn tenant_association_follows_account_column_both_ways() {
        let store = store();
        let account = EntityRecord::new("Account", "42");
        store.insert_entity(&account).unwrap();
        let membership = EntityRecord::new("Membership", "m1").with_account("42");
        store.insert_entity(&membership).unwrap();
        store
            .insert_entity(&EntityRecord::new("Membership", "m2").with_account("7"))
            .unwrap();

        assert_eq!(
            store
                .resolve_singular(&membership, &association("Membership", "account"))
                .unwrap(),
            Some(account.entity.clone())
        );
        assert_eq!(
            store
                .resolve_collection(&account, &association("Account", "memberships"))
                .unwrap(),
            vec![EntityRef::new("Membership", "m1")]
        );

        let orphan = EntityRecord::new("Membership", "m3");
        assert_eq!(
            store
                .resolve_singular(&orphan, &association("Membership", "account"))
                .unwrap(),
            None
        );
        store.delete_entity(&account.entity).unwrap();
        assert_eq!(
            store
                .resolve_singular(&membership, &association("Membership", "account"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn update_and_snapshot_reflect_latest_attributes() {
        let store = store();
        let record = EntityRecord::new("Chat", "9").with_attributes(json!({"title": "old"}));
        store.insert_entity(&record).unwrap();
        store
            .update_entity(&record.clone().with_attributes(json!({"title": "new"})))
            .unwrap();

        let snapshot = store.snapshot(&record).expect("live entity has a snapshot");
        assert_eq!(snapshot["attributes"]["title"], "new");
        assert!(matches!(
            store.update_entity(&EntityRecord::new("Chat", "missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn subscriber_grants_round_trip() {
        let store = store();
        store.upsert_subscriber("alice", false).unwrap();
        store.grant_account("alice", "42").unwrap();
        store.grant_account("alice", "42").unwrap();
        assert!(!store.is_admin("alice").unwrap());
        assert!(!store.is_admin("nobody").unwrap());
        assert_eq!(store.granted_accounts("alice").unwrap().len(), 1);

        store.upsert_subscriber("alice", true).unwrap();
        assert!(store.is_admin("alice").unwrap());
    }
}
