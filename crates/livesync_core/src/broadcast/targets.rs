//! Per-type broadcast target declarations.
//!
//! # Responsibility
//! - Hold the startup-time table of which channels each entity type fans out to.
//! - Resolve association targets through the reflector once, at declaration.
//!
//! # Invariants
//! - One declaration per entity type; the table is read-only once shared.
//! - Unknown associations are kept as `Unresolved` and reported, never fatal.
//! - The self-channel is implicit for every type, declared or not.

use crate::model::channel::is_valid_entity_type;
use crate::model::entity::{plural_prop, singular_prop};
use crate::schema::reflect::{AssociationDescriptor, AssociationReflector};
use log::{info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Fan-out target declared for an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BroadcastTarget {
    /// The record's own `Type:id` channel. Always notified; accepted for
    /// completeness of declarations.
    SelfChannel,
    /// The privileged `Type:all` collection channel.
    AllCollection,
    /// Self-channels of the record(s) behind a named association.
    Association(String),
}

impl BroadcastTarget {
    pub fn association(name: impl Into<String>) -> Self {
        Self::Association(name.into())
    }
}

/// Target after reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    AllCollection,
    Association(AssociationDescriptor),
    Unresolved(String),
}

/// Prop names used instead of the inflected defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropOverrides {
    pub self_prop: Option<String>,
    pub collection_prop: Option<String>,
}

/// Broadcast configuration for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBroadcastConfig {
    pub entity_type: String,
    pub targets: Vec<ResolvedTarget>,
    pub overrides: PropOverrides,
    declared: bool,
}

impl TypeBroadcastConfig {
    fn empty(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            targets: Vec::new(),
            overrides: PropOverrides::default(),
            declared: false,
        }
    }

    /// Prop named on the self-channel: override, else `singular(Type)`.
    pub fn self_prop(&self) -> String {
        self.overrides
            .self_prop
            .clone()
            .unwrap_or_else(|| singular_prop(&self.entity_type))
    }

    /// Prop named on the collection channel: override, else `plural(Type)`.
    pub fn collection_prop(&self) -> String {
        self.overrides
            .collection_prop
            .clone()
            .unwrap_or_else(|| plural_prop(&self.entity_type))
    }
}

/// Startup-time broadcast registry, injected into the publisher.
pub struct BroadcastRegistry {
    reflector: Arc<dyn AssociationReflector>,
    types: BTreeMap<String, TypeBroadcastConfig>,
}

impl BroadcastRegistry {
    pub fn new(reflector: Arc<dyn AssociationReflector>) -> Self {
        Self {
            reflector,
            types: BTreeMap::new(),
        }
    }

    /// Declares the fan-out targets of one entity type.
    ///
    /// # Errors
    /// - `InvalidEntityType` when the type name is not a channel-safe type name.
    /// - `DuplicateDeclaration` when the type was already declared.
    ///
    /// Unknown associations do not fail the declaration; they are logged and
    /// listed by [`BroadcastRegistry::unresolved`].
    pub fn declare_broadcast_targets(
        &mut self,
        entity_type: &str,
        targets: &[BroadcastTarget],
    ) -> Result<(), BroadcastConfigError> {
        let entity_type = normalize_entity_type(entity_type)?;
        let config = self
            .types
            .entry(entity_type.clone())
            .or_insert_with(|| TypeBroadcastConfig::empty(&entity_type));
        if config.declared {
            return Err(BroadcastConfigError::DuplicateDeclaration(entity_type));
        }

        let mut resolved = Vec::with_capacity(targets.len());
        for target in targets {
            let next = match target {
                BroadcastTarget::SelfChannel => continue,
                BroadcastTarget::AllCollection => ResolvedTarget::AllCollection,
                BroadcastTarget::Association(name) => {
                    match self.reflector.reflect_association(&entity_type, name) {
                        Some(descriptor) => ResolvedTarget::Association(descriptor),
                        None => {
                            warn!(
                                "event=broadcast_declare module=broadcast status=unknown_association type={} association={}",
                                entity_type, name
                            );
                            ResolvedTarget::Unresolved(name.clone())
                        }
                    }
                }
            };
            if !resolved.contains(&next) {
                resolved.push(next);
            }
        }

        info!(
            "event=broadcast_declare module=broadcast status=ok type={} targets={}",
            entity_type,
            resolved.len()
        );
        config.targets = resolved;
        config.declared = true;
        Ok(())
    }

    /// Deprecated `{parent: association}` declaration scheme.
    ///
    /// Only the association names are used; each maps onto
    /// `BroadcastTarget::Association`.
    #[deprecated(note = "declare `BroadcastTarget::Association` via `declare_broadcast_targets`")]
    pub fn declare_parent_targets(
        &mut self,
        entity_type: &str,
        parents: &[(&str, &str)],
    ) -> Result<(), BroadcastConfigError> {
        warn!(
            "event=broadcast_declare module=broadcast status=deprecated_alias type={} parents={}",
            entity_type.trim(),
            parents.len()
        );
        let targets: Vec<BroadcastTarget> = parents
            .iter()
            .map(|(_, association)| BroadcastTarget::association(association.trim()))
            .collect();
        self.declare_broadcast_targets(entity_type, &targets)
    }

    /// Replaces the default inflected prop names of one type.
    pub fn override_props(
        &mut self,
        entity_type: &str,
        overrides: PropOverrides,
    ) -> Result<(), BroadcastConfigError> {
        let entity_type = normalize_entity_type(entity_type)?;
        self.types
            .entry(entity_type.clone())
            .or_insert_with(|| TypeBroadcastConfig::empty(&entity_type))
            .overrides = overrides;
        Ok(())
    }

    pub fn config_for(&self, entity_type: &str) -> Option<&TypeBroadcastConfig> {
        self.types.get(entity_type)
    }

    /// Self prop for any type, declared or not.
    pub fn self_prop_for(&self, entity_type: &str) -> String {
        match self.types.get(entity_type) {
            Some(config) => config.self_prop(),
            None => singular_prop(entity_type),
        }
    }

    /// Returns declared type names in sorted order.
    pub fn declared_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// Returns every association target the reflector could not resolve.
    pub fn unresolved(&self) -> Vec<BroadcastConfigError> {
        self.types
            .values()
            .flat_map(|config| {
                config.targets.iter().filter_map(|target| match target {
                    ResolvedTarget::Unresolved(name) => {
                        Some(BroadcastConfigError::UnknownAssociation {
                            entity_type: config.entity_type.clone(),
                            association: name.clone(),
                        })
                    }
                    _ => None,
                })
            })
            .collect()
    }
}

fn normalize_entity_type(value: &str) -> Result<String, BroadcastConfigError> {
    let trimmed = value.trim();
    if !is_valid_entity_type(trimmed) {
        return Err(BroadcastConfigError::InvalidEntityType(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Broadcast configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastConfigError {
    InvalidEntityType(String),
    DuplicateDeclaration(String),
    UnknownAssociation {
        entity_type: String,
        association: String,
    },
}

impl Display for BroadcastConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEntityType(value) => write!(f, "entity type is invalid: `{value}`"),
            Self::DuplicateDeclaration(value) => {
                write!(f, "broadcast targets already declared for {value}")
            }
            Self::UnknownAssociation {
                entity_type,
                association,
            } => write!(f, "unknown association {entity_type}.{association}"),
        }
    }
}

impl Error for BroadcastConfigError {}
