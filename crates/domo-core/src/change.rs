//! State-change records delivered to subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActorKind, Attribution, EntityId, State, StateValue};

/// One observed transition of one entity
///
/// Per entity, changes are strictly time-ordered and contiguous: the `old`
/// state of change N+1 is the `new` state of change N as observed by this
/// process. `old` is `None` for the first observation of an entity and
/// `new` is `None` when an entity is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub entity_id: EntityId,
    pub old: Option<State>,
    pub new: Option<State>,
    pub timestamp: DateTime<Utc>,
    pub attribution: Attribution,
}

impl StateChange {
    pub fn old_value(&self) -> Option<&StateValue> {
        self.old.as_ref().map(|s| &s.value)
    }

    pub fn new_value(&self) -> Option<&StateValue> {
        self.new.as_ref().map(|s| &s.value)
    }

    /// Whether the value actually differs between old and new
    pub fn value_changed(&self) -> bool {
        self.old_value() != self.new_value()
    }

    pub fn actor(&self) -> ActorKind {
        self.attribution.kind()
    }
}
