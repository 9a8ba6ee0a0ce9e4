//! Edge triggers: react to transitions, never to repeated states

use domo_core::{ActorKind, EntityId, StateChange};
use domo_event_bus::SubscriptionHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::StatePredicate;
use crate::EngineCtx;

/// Which direction of transition fires the trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// The new state satisfies the predicate and the old did not
    Rising,
    /// The old state satisfied the predicate and the new does not
    Falling,
}

/// Parameters for an edge trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub edge: Edge,

    /// Actor kinds whose transitions are ignored; a rule lists
    /// `Automated` here to avoid reacting to its own prior actions
    #[serde(default)]
    pub ignore_actors: Vec<ActorKind>,
}

impl EdgeConfig {
    pub fn rising() -> Self {
        Self {
            edge: Edge::Rising,
            ignore_actors: Vec::new(),
        }
    }

    pub fn falling() -> Self {
        Self {
            edge: Edge::Falling,
            ignore_actors: Vec::new(),
        }
    }

    pub fn ignoring(mut self, kind: ActorKind) -> Self {
        self.ignore_actors.push(kind);
        self
    }
}

/// Fires exactly on predicate-satisfying transitions
///
/// A missing old state counts as not matching, so the first observation of
/// an entity can produce a rising edge. Value-identical reports never fire.
pub struct EdgeTrigger {
    entity_id: EntityId,
    predicate: StatePredicate,
    config: EdgeConfig,
}

impl EdgeTrigger {
    pub fn new(entity_id: EntityId, predicate: StatePredicate, config: EdgeConfig) -> Self {
        Self {
            entity_id,
            predicate,
            config,
        }
    }

    pub fn subscribe<F>(self, ctx: &EngineCtx, emit: F) -> SubscriptionHandle
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let Self {
            entity_id,
            predicate,
            config,
        } = self;

        ctx.bus.subscribe(entity_id, move |change| {
            if config.ignore_actors.contains(&change.actor()) {
                trace!(entity_id = %change.entity_id, actor = ?change.actor(), "ignoring transition by actor kind");
                return;
            }

            let old_ok = change.old_value().map(|v| predicate(v)).unwrap_or(false);
            let new_ok = change.new_value().map(|v| predicate(v)).unwrap_or(false);
            let fired = match config.edge {
                Edge::Rising => new_ok && !old_ok,
                Edge::Falling => old_ok && !new_ok,
            };

            if fired {
                debug!(
                    entity_id = %change.entity_id,
                    edge = ?config.edge,
                    old = change.old_value().map(|v| v.as_str()).unwrap_or("none"),
                    new = change.new_value().map(|v| v.as_str()).unwrap_or("none"),
                    "edge trigger fired"
                );
                emit(change);
            }
        })
    }
}
