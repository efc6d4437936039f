//! Entity identity and change event model.
//!
//! # Responsibility
//! - Name the entities whose mutations are broadcast.
//! - Derive the default prop names a type is refreshed under.
//!
//! # Invariants
//! - `EntityRef` is the only identity used on channels; attributes never are.
//! - `ChangeEvent` is transient and never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};

/// Kind of mutation reported by the persistence post-commit hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Type and id of one persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Entity as seen by the broadcast subsystem.
///
/// `account_id` is the tenant the record belongs to. An `Account` record is
/// its own tenant and leaves this `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(flatten)]
    pub entity: EntityRef,
    pub account_id: Option<String>,
    /// Opaque attribute document, used for live snapshots only.
    pub attributes: Value,
}

impl EntityRecord {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity: EntityRef::new(entity_type, entity_id),
            account_id: None,
            attributes: Value::Object(Default::default()),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity.entity_id
    }
}

/// One mutation notification, consumed immediately by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(flatten)]
    pub entity: EntityRef,
    pub operation: ChangeOperation,
}

impl ChangeEvent {
    pub fn new(entity: EntityRef, operation: ChangeOperation) -> Self {
        Self { entity, operation }
    }
}

/// Returns the default single-record prop name for a type.
///
/// `BlogPost` -> `blog_post`, `Account` -> `account`.
pub fn singular_prop(entity_type: &str) -> String {
    let base = entity_type.rsplit("::").next().unwrap_or(entity_type);
    let mut out = String::with_capacity(base.len() + 4);
    let mut previous_lower = false;
    for ch in base.chars() {
        if ch.is_ascii_uppercase() {
            if previous_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            previous_lower = false;
        } else {
            previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

/// Returns the default collection prop name for a type.
///
/// `Account` -> `accounts`, `Company` -> `companies`, `Box` -> `boxes`.
pub fn plural_prop(entity_type: &str) -> String {
    pluralize(&singular_prop(entity_type))
}

fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            return format!("{stem}ies");
        }
    }
    if ["s", "x", "z", "ch", "sh"]
        .iter()
        .any(|suffix| word.ends_with(suffix))
    {
        return format!("{word}es");
    }
    format!("{word}s")
}
