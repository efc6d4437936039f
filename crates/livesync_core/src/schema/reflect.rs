//! Association reflection contract and static schema table.
//!
//! # Responsibility
//! - Answer "does `Type.name` exist, and is it singular or a collection?".
//! - Hold the association table declared once at startup.
//!
//! - Say where the relation is stored, so resolvers follow one source of truth.
//!
//! # Invariants
//! - Descriptors are immutable after declaration.
//! - One `(type, name)` pair maps to exactly one descriptor.
//! - A `has_many` with an inverse reads the inverse side's storage.

use log::warn;
use std::collections::BTreeMap;

/// Whether an association points at one record or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Singular,
    Collection,
}

/// Where the records behind an association are found.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssociationStorage {
    /// Link rows owned by the declaring side (`owner.name -> target`).
    Link,
    /// The declaring record's tenant column (`account_id`).
    TenantColumn,
    /// Link rows of the target side's association (`target.inverse -> owner`).
    InverseLink(String),
    /// Target records whose tenant column names the owner.
    InverseTenantColumn,
}

/// Resolved association metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationDescriptor {
    pub name: String,
    pub cardinality: Cardinality,
    pub target_type: String,
    pub storage: AssociationStorage,
}

impl AssociationDescriptor {
    pub fn is_collection(&self) -> bool {
        self.cardinality == Cardinality::Collection
    }
}

/// Reflection contract consumed from the domain model.
pub trait AssociationReflector: Send + Sync {
    /// Returns `None` when `entity_type` has no association called `name`.
    fn reflect_association(&self, entity_type: &str, name: &str)
        -> Option<AssociationDescriptor>;
}

/// Declared association table.
#[derive(Debug, Clone, Default)]
pub struct ModelSchema {
    associations: BTreeMap<(String, String), AssociationDescriptor>,
    inverses: BTreeMap<(String, String), String>,
}

impl ModelSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a singular association stored as a link on `entity_type`.
    pub fn belongs_to(self, entity_type: &str, name: &str, target_type: &str) -> Self {
        self.declare(
            entity_type,
            name,
            Cardinality::Singular,
            target_type,
            AssociationStorage::Link,
        )
    }

    /// Declares a singular association read from the record's `account_id`.
    pub fn belongs_to_tenant(self, entity_type: &str, name: &str, target_type: &str) -> Self {
        self.declare(
            entity_type,
            name,
            Cardinality::Singular,
            target_type,
            AssociationStorage::TenantColumn,
        )
    }

    /// Declares a singular association stored as a link on `entity_type`.
    pub fn has_one(self, entity_type: &str, name: &str, target_type: &str) -> Self {
        self.declare(
            entity_type,
            name,
            Cardinality::Singular,
            target_type,
            AssociationStorage::Link,
        )
    }

    /// Declares a collection association.
    pub fn has_many(self, entity_type: &str, name: &str, target_type: &str) -> Self {
        self.declare(
            entity_type,
            name,
            Cardinality::Collection,
            target_type,
            AssociationStorage::Link,
        )
    }

    /// Declares that `entity_type.name` is the other side of
    /// `target_type.inverse`, where `target_type` is the declared target.
    ///
    /// Members are then read from the inverse side's storage as well.
    pub fn inverse_of(mut self, entity_type: &str, name: &str, inverse: &str) -> Self {
        let key = (entity_type.trim().to_string(), name.trim().to_string());
        if !self.associations.contains_key(&key) {
            warn!(
                "event=association_inverse module=schema status=skip reason=undeclared type={} association={}",
                key.0, key.1
            );
            return self;
        }
        self.inverses.insert(key, inverse.trim().to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    fn declare(
        mut self,
        entity_type: &str,
        name: &str,
        cardinality: Cardinality,
        target_type: &str,
        storage: AssociationStorage,
    ) -> Self {
        let key = (entity_type.trim().to_string(), name.trim().to_string());
        let descriptor = AssociationDescriptor {
            name: key.1.clone(),
            cardinality,
            target_type: target_type.trim().to_string(),
            storage,
        };
        if let Some(previous) = self.associations.insert(key, descriptor) {
            warn!(
                "event=association_redeclared module=schema status=overwritten type={} association={}",
                entity_type, previous.name
            );
        }
        self
    }
}

impl AssociationReflector for ModelSchema {
    fn reflect_association(
        &self,
        entity_type: &str,
        name: &str,
    ) -> Option<AssociationDescriptor> {
        let key = (entity_type.to_string(), name.to_string());
        let mut descriptor = self.associations.get(&key).cloned()?;
        if let Some(inverse) = self.inverses.get(&key) {
            let inverse_storage = self
                .associations
                .get(&(descriptor.target_type.clone(), inverse.clone()))
                .map(|inverse| &inverse.storage);
            descriptor.storage = match inverse_storage {
                Some(AssociationStorage::TenantColumn) => AssociationStorage::InverseTenantColumn,
                _ => AssociationStorage::InverseLink(inverse.clone()),
            };
        }
        Some(descriptor)
    }
}
