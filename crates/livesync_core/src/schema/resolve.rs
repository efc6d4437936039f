//! Entity resolution contract used by fan-out and subscribe paths.
//!
//! # Responsibility
//! - Load records and follow declared associations without exposing storage.
//!
//! # Invariants
//! - Resolution is read-only.
//! - A missing record is `Ok(None)` / an empty list, never an error.

use crate::model::entity::{EntityRecord, EntityRef};
use crate::schema::reflect::AssociationDescriptor;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Resolver failure that is not "record missing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    pub entity: EntityRef,
    pub message: String,
}

impl ResolveError {
    pub fn new(entity: &EntityRef, message: impl Into<String>) -> Self {
        Self {
            entity: entity.clone(),
            message: message.into(),
        }
    }
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to resolve {}: {}", self.entity, self.message)
    }
}

impl Error for ResolveError {}

/// Persistence-side lookups needed by the broadcast subsystem.
pub trait EntityResolver: Send + Sync {
    fn find(&self, entity: &EntityRef) -> ResolveResult<Option<EntityRecord>>;

    /// Follows a singular association from `owner`.
    ///
    /// `owner` may be the last state of a deleted record.
    fn resolve_singular(
        &self,
        owner: &EntityRecord,
        association: &AssociationDescriptor,
    ) -> ResolveResult<Option<EntityRef>>;

    /// Follows a collection association from `owner`.
    fn resolve_collection(
        &self,
        owner: &EntityRecord,
        association: &AssociationDescriptor,
    ) -> ResolveResult<Vec<EntityRef>>;
}

/// Source of the partial state pushed to late subscribers of live types.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self, entity: &EntityRecord) -> Option<Value>;
}
