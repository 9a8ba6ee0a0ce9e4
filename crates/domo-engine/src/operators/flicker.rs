//! Flicker detection: a failing sensor announces itself by flapping

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use domo_core::{EntityId, StateValue};
use domo_event_bus::SubscriptionHandle;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::EngineCtx;

/// Parameters for flicker detection
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlickerConfig {
    /// Sliding window measured on event timestamps
    pub window_secs: u64,

    /// Number of distinct-value transitions within the window that
    /// counts as flicker
    pub min_transitions: usize,
}

impl FlickerConfig {
    pub fn new(window_secs: u64, min_transitions: usize) -> Self {
        Self {
            window_secs,
            min_transitions,
        }
    }
}

/// One buffered transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: Option<StateValue>,
    pub to: Option<StateValue>,
}

/// Emits the buffered transitions when an entity flaps too fast
///
/// Only distinct-value transitions are buffered; entries older than the
/// window (relative to the newest event's timestamp) are pruned on every
/// event. The emission carries exactly the first `min_transitions`
/// in-window transitions and clears the buffer, so a burst of N > min
/// transitions produces one emission; the surplus starts a new buffer.
pub struct FlickerDetector {
    entity_id: EntityId,
    config: FlickerConfig,
}

impl FlickerDetector {
    pub fn new(entity_id: EntityId, config: FlickerConfig) -> Self {
        Self { entity_id, config }
    }

    pub fn subscribe<F>(self, ctx: &EngineCtx, emit: F) -> SubscriptionHandle
    where
        F: Fn(&[Transition]) + Send + Sync + 'static,
    {
        let Self { entity_id, config } = self;
        let window = Duration::seconds(config.window_secs as i64);
        let buffer: Arc<Mutex<VecDeque<Transition>>> = Arc::new(Mutex::new(VecDeque::new()));

        ctx.bus.subscribe(entity_id, move |change| {
            if !change.value_changed() {
                return;
            }

            let batch = {
                let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                buffer.push_back(Transition {
                    at: change.timestamp,
                    from: change.old_value().cloned(),
                    to: change.new_value().cloned(),
                });

                let horizon = change.timestamp - window;
                while buffer.front().is_some_and(|t| t.at < horizon) {
                    buffer.pop_front();
                }

                if buffer.len() >= config.min_transitions {
                    Some(buffer.drain(..).collect::<Vec<_>>())
                } else {
                    None
                }
            };

            if let Some(batch) = batch {
                warn!(
                    entity_id = %change.entity_id,
                    transitions = batch.len(),
                    window_secs = config.window_secs,
                    "flicker detected"
                );
                emit(&batch);
            }
        })
    }
}
