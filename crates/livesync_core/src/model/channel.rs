//! Channel id grammar.
//!
//! # Responsibility
//! - Parse and format `Type:id`, `Type:all` and `Type:id/association` keys.
//!
//! # Invariants
//! - `Type` starts with an uppercase ASCII letter; `::` namespaces are allowed.
//! - `all` is reserved and never parsed as a record id.
//! - The association form is only meaningful for subscribe requests; markers
//!   are never published on it.

use crate::model::entity::EntityRef;
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Reserved selector naming the whole collection of a type.
pub const ALL_SELECTOR: &str = "all";

const TYPE_NAME: &str = r"[A-Z][A-Za-z0-9_]*(?:::[A-Z][A-Za-z0-9_]*)*";

static CHANNEL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^({TYPE_NAME}):([A-Za-z0-9_\-]+)(?:/([a-z_][a-z0-9_]*))?$"
    ))
    .expect("channel id pattern is a valid regex")
});

static TYPE_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("^{TYPE_NAME}$")).expect("type name pattern is a valid regex")
});

/// Whether `value` can stand on the left of a channel id.
pub fn is_valid_entity_type(value: &str) -> bool {
    TYPE_NAME_PATTERN.is_match(value)
}

/// Right-hand side of a channel id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelSelector {
    All,
    Id(String),
    Association { id: String, name: String },
}

impl Display for ChannelSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "{ALL_SELECTOR}"),
            Self::Id(id) => write!(f, "{id}"),
            Self::Association { id, name } => write!(f, "{id}/{name}"),
        }
    }
}

/// Parsed channel key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId {
    entity_type: String,
    selector: ChannelSelector,
}

impl ChannelId {
    /// Parses one channel id string.
    ///
    /// # Errors
    /// - `Empty` for blank input.
    /// - `Malformed` when the value does not match `Type:selector[/association]`.
    pub fn parse(value: &str) -> Result<Self, ChannelIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ChannelIdError::Empty);
        }
        let captures = CHANNEL_ID_PATTERN
            .captures(trimmed)
            .ok_or_else(|| ChannelIdError::Malformed(trimmed.to_string()))?;

        let entity_type = captures[1].to_string();
        let head = captures[2].to_string();
        let selector = match captures.get(3) {
            Some(_) if head == ALL_SELECTOR => {
                return Err(ChannelIdError::Malformed(trimmed.to_string()));
            }
            Some(association) => ChannelSelector::Association {
                id: head,
                name: association.as_str().to_string(),
            },
            None if head == ALL_SELECTOR => ChannelSelector::All,
            None => ChannelSelector::Id(head),
        };

        Ok(Self {
            entity_type,
            selector,
        })
    }

    /// Self-channel of one record: `Type:id`.
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_type: entity.entity_type.clone(),
            selector: ChannelSelector::Id(entity.entity_id.clone()),
        }
    }

    /// Collection channel of a type: `Type:all`.
    pub fn for_collection(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            selector: ChannelSelector::All,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    /// Returns whether markers may be published on this channel.
    pub fn is_publishable(&self) -> bool {
        !matches!(self.selector, ChannelSelector::Association { .. })
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.selector)
    }
}

impl FromStr for ChannelId {
    type Err = ChannelIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// Client-local channel id errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIdError {
    Empty,
    Malformed(String),
}

impl Display for ChannelIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "channel id must not be empty"),
            Self::Malformed(value) => write!(
                f,
                "malformed channel id `{value}`; expected Type:selector[/association]"
            ),
        }
    }
}

impl Error for ChannelIdError {}
