//! Entity ID type representing a domain.name pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity id must contain exactly one '.' separator")]
    MissingSeparator,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("name cannot be empty")]
    EmptyName,

    #[error("domain contains invalid characters (lowercase alphanumeric and inner underscores only)")]
    InvalidDomain,

    #[error("name contains invalid characters (lowercase alphanumeric and inner underscores only)")]
    InvalidName,
}

/// Identifies one entity on the hub, e.g. `lock.front_door`
///
/// An entity id is a `domain.name` pair. Both halves are lowercase
/// alphanumeric with underscores; neither may start or end with an
/// underscore, and the domain may not contain a double underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    raw: String,
    dot: usize,
}

impl EntityId {
    /// Build an entity id from its two halves
    pub fn new(domain: &str, name: &str) -> Result<Self, EntityIdError> {
        if domain.is_empty() {
            return Err(EntityIdError::EmptyDomain);
        }
        if name.is_empty() {
            return Err(EntityIdError::EmptyName);
        }
        if domain.contains("__") || !is_valid_segment(domain) {
            return Err(EntityIdError::InvalidDomain);
        }
        if !is_valid_segment(name) {
            return Err(EntityIdError::InvalidName);
        }

        Ok(Self {
            raw: format!("{domain}.{name}"),
            dot: domain.len(),
        })
    }

    /// The domain half, e.g. `lock`
    pub fn domain(&self) -> &str {
        &self.raw[..self.dot]
    }

    /// The name half, e.g. `front_door`
    pub fn name(&self) -> &str {
        &self.raw[self.dot + 1..]
    }

    /// The full `domain.name` form
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn is_valid_segment(s: &str) -> bool {
    if s.starts_with('_') || s.ends_with('_') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, name)) if !name.contains('.') => Self::new(domain, name),
            _ => Err(EntityIdError::MissingSeparator),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.raw
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
