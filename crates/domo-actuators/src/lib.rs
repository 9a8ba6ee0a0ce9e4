//! Outbound actuator calls
//!
//! Rules act on the world through `ActuatorRegistry::invoke`, keyed by the
//! target entity's domain and an action name (`lock.unlock`,
//! `switch.turn_on`). Handlers must not block: the engine treats every
//! invocation as fire-and-forget, so a real hub adapter enqueues the
//! invocation onto a channel and returns immediately. Failures are
//! reported to the caller for logging only; the engine never retries.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use domo_core::{Attribution, EntityId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Result type for actuator calls
pub type ActuatorResult<T> = Result<T, ActuatorError>;

#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    #[error("no handler for action {domain}.{action}")]
    NotFound { domain: String, action: String },

    #[error("actuator call failed: {0}")]
    CallFailed(String),
}

/// One outbound call to an entity actuator
#[derive(Debug, Clone)]
pub struct Invocation {
    pub entity_id: EntityId,
    pub action: String,
    pub params: serde_json::Value,
    pub attribution: Attribution,
}

type Handler = Arc<dyn Fn(Invocation) -> ActuatorResult<()> + Send + Sync>;

/// Registry of actuator handlers keyed by `domain.action`
pub struct ActuatorRegistry {
    handlers: DashMap<String, Handler>,
}

impl ActuatorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Register the handler for one `domain.action` pair
    pub fn register(
        &self,
        domain: &str,
        action: &str,
        handler: impl Fn(Invocation) -> ActuatorResult<()> + Send + Sync + 'static,
    ) {
        let key = format!("{domain}.{action}");
        debug!(key = %key, "registering actuator handler");
        self.handlers.insert(key, Arc::new(handler));
    }

    /// Invoke an action on an entity
    ///
    /// Resolves the handler from the entity's domain. The error is returned
    /// for the caller to log; callers do not retry and do not roll back
    /// state they updated optimistically.
    #[instrument(skip(self, params, attribution), fields(entity_id = %entity_id, action = %action))]
    pub fn invoke(
        &self,
        entity_id: &EntityId,
        action: &str,
        params: serde_json::Value,
        attribution: Attribution,
    ) -> ActuatorResult<()> {
        let key = format!("{}.{action}", entity_id.domain());
        let Some(handler) = self.handlers.get(&key).map(|h| h.clone()) else {
            warn!("actuator action not registered");
            return Err(ActuatorError::NotFound {
                domain: entity_id.domain().to_string(),
                action: action.to_string(),
            });
        };

        debug!(actor = ?attribution.kind(), "invoking actuator");
        handler(Invocation {
            entity_id: entity_id.clone(),
            action: action.to_string(),
            params,
            attribution,
        })
    }

    pub fn has_action(&self, domain: &str, action: &str) -> bool {
        self.handlers.contains_key(&format!("{domain}.{action}"))
    }

    pub fn unregister(&self, domain: &str, action: &str) -> bool {
        self.handlers.remove(&format!("{domain}.{action}")).is_some()
    }

    pub fn action_count(&self) -> usize {
        self.handlers.len()
    }
}

/// A handler that forwards invocations onto a tokio channel
///
/// This is the fire-and-forget shape hub adapters use: the send never
/// blocks the event path, and a closed channel surfaces as `CallFailed`.
pub fn channel_handler(
    tx: mpsc::UnboundedSender<Invocation>,
) -> impl Fn(Invocation) -> ActuatorResult<()> {
    move |invocation| {
        tx.send(invocation)
            .map_err(|e| ActuatorError::CallFailed(format!("adapter channel closed: {e}")))
    }
}

/// Records every invocation in order; for tests and dry runs
#[derive(Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<Invocation>>,
    fail: Mutex<bool>,
}

impl RecordingActuator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler closure to register for any `domain.action` to record
    pub fn handler(self: &Arc<Self>) -> impl Fn(Invocation) -> ActuatorResult<()> {
        let this = self.clone();
        move |invocation| {
            this.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(invocation);
            if *this.fail.lock().unwrap_or_else(PoisonError::into_inner) {
                Err(ActuatorError::CallFailed("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Make subsequent recorded calls fail (they are still recorded)
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `action` was invoked on `entity_id`
    pub fn count_for(&self, entity_id: &EntityId, action: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| &c.entity_id == entity_id && c.action == action)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn front_door() -> EntityId {
        "lock.front_door".parse().unwrap()
    }

    #[test]
    fn test_register_and_invoke() {
        let registry = ActuatorRegistry::new();
        let recorder = RecordingActuator::new();
        registry.register("lock", "unlock", recorder.handler());

        registry
            .invoke(
                &front_door(),
                "unlock",
                json!({}),
                Attribution::physical(),
            )
            .unwrap();

        assert_eq!(recorder.count_for(&front_door(), "unlock"), 1);
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActuatorRegistry::new();
        let result = registry.invoke(
            &front_door(),
            "unlock",
            json!({}),
            Attribution::physical(),
        );
        assert!(matches!(result, Err(ActuatorError::NotFound { .. })));
    }

    #[test]
    fn test_failure_is_returned_and_recorded() {
        let registry = ActuatorRegistry::new();
        let recorder = RecordingActuator::new();
        registry.register("lock", "lock", recorder.handler());
        recorder.set_failing(true);

        let result = registry.invoke(
            &front_door(),
            "lock",
            json!({}),
            Attribution::physical(),
        );

        assert!(matches!(result, Err(ActuatorError::CallFailed(_))));
        assert_eq!(recorder.count_for(&front_door(), "lock"), 1);
    }

    #[test]
    fn test_invocations_recorded_in_order() {
        let registry = ActuatorRegistry::new();
        let recorder = RecordingActuator::new();
        registry.register("lock", "unlock", recorder.handler());
        registry.register("lock", "lock", recorder.handler());

        for action in ["unlock", "lock", "unlock"] {
            registry
                .invoke(&front_door(), action, json!({}), Attribution::physical())
                .unwrap();
        }

        let actions: Vec<String> = recorder.calls().into_iter().map(|c| c.action).collect();
        assert_eq!(actions, vec!["unlock", "lock", "unlock"]);
    }

    #[tokio::test]
    async fn test_channel_handler_forwards() {
        let registry = ActuatorRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("switch", "turn_on", channel_handler(tx));

        let porch: EntityId = "switch.porch_light".parse().unwrap();
        registry
            .invoke(&porch, "turn_on", json!({}), Attribution::physical())
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.entity_id, porch);
        assert_eq!(received.action, "turn_on");
    }
}
