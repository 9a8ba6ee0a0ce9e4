//! Attribution of state transitions to the actor that caused them

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Classification of who produced a state transition
///
/// Used by rules to avoid feedback loops: a rule can filter out transitions
/// caused by its own (or another rule's) prior actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// A person acted on the device itself (flipped a switch, closed a door)
    Physical,
    /// This engine or another rule caused the transition
    Automated,
    /// A user acted through an app or UI
    Manual,
    /// The source could not be determined
    Unknown,
}

/// Opaque actor identifier attached to every state transition
///
/// Mirrors the hub's context chain: `parent_id` links a transition to the
/// action that caused it, `user_id` identifies an app/UI user. The actor
/// kind is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Unique identifier for this attribution (ULID)
    pub id: String,

    /// User that initiated the action through an app or UI, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Attribution id of the action that caused this one, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Attribution {
    /// A transition caused by direct physical interaction
    pub fn physical() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// A transition caused by a user through an app or UI
    pub fn manual(user_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: Some(user_id.into()),
            parent_id: None,
        }
    }

    /// A transition caused by automation, chained to its triggering cause
    pub fn automated_from(parent: &Attribution) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: parent.user_id.clone(),
            parent_id: Some(parent.id.clone()),
        }
    }

    /// A transition whose source metadata was missing
    pub fn unknown() -> Self {
        Self {
            id: String::new(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Derive the actor kind from the identifier chain
    pub fn kind(&self) -> ActorKind {
        if self.id.is_empty() {
            ActorKind::Unknown
        } else if self.parent_id.is_some() {
            ActorKind::Automated
        } else if self.user_id.is_some() {
            ActorKind::Manual
        } else {
            ActorKind::Physical
        }
    }
}

impl Default for Attribution {
    fn default() -> Self {
        Self::physical()
    }
}
