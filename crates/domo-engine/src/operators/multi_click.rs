//! Multi-click detection on physical switches and buttons

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use domo_core::EntityId;
use domo_event_bus::SubscriptionHandle;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StatePredicate;
use crate::EngineCtx;

fn default_click_count() -> usize {
    2
}

/// Parameters for multi-click detection
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MultiClickConfig {
    /// Maximum gap between consecutive clicks, in milliseconds
    pub max_gap_ms: u64,

    /// How many clicks make one emission
    #[serde(default = "default_click_count")]
    pub click_count: usize,
}

impl MultiClickConfig {
    pub fn new(max_gap_ms: u64) -> Self {
        Self {
            max_gap_ms,
            click_count: default_click_count(),
        }
    }

    pub fn clicks(mut self, click_count: usize) -> Self {
        self.click_count = click_count;
        self
    }
}

/// Emits when the last N qualifying transitions happened close together
///
/// A click is a rising edge of the predicate. Gaps are measured on event
/// timestamps, not wall-clock receipt time, and the buffer is kept sorted
/// by timestamp, so out-of-order delivery within a batch still measures
/// the true gap. The buffer is cleared after an emission; a triple press
/// yields one double-click emission, not two.
pub struct MultiClickDetector {
    entity_id: EntityId,
    predicate: StatePredicate,
    config: MultiClickConfig,
}

impl MultiClickDetector {
    pub fn new(entity_id: EntityId, predicate: StatePredicate, config: MultiClickConfig) -> Self {
        Self {
            entity_id,
            predicate,
            config,
        }
    }

    pub fn subscribe<F>(self, ctx: &EngineCtx, emit: F) -> SubscriptionHandle
    where
        F: Fn(&[DateTime<Utc>]) + Send + Sync + 'static,
    {
        let Self {
            entity_id,
            predicate,
            config,
        } = self;
        let max_gap = Duration::milliseconds(config.max_gap_ms as i64);
        let clicks: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));

        ctx.bus.subscribe(entity_id, move |change| {
            let old_ok = change.old_value().map(|v| predicate(v)).unwrap_or(false);
            let new_ok = change.new_value().map(|v| predicate(v)).unwrap_or(false);
            if !new_ok || old_ok {
                return;
            }

            let batch = {
                let mut clicks = clicks.lock().unwrap_or_else(PoisonError::into_inner);
                let position = clicks.partition_point(|t| *t <= change.timestamp);
                clicks.insert(position, change.timestamp);
                if clicks.len() > config.click_count {
                    clicks.remove(0);
                }

                let complete = clicks.len() == config.click_count
                    && clicks.windows(2).all(|pair| pair[1] - pair[0] <= max_gap);
                if complete {
                    Some(std::mem::take(&mut *clicks))
                } else {
                    None
                }
            };

            if let Some(batch) = batch {
                debug!(
                    entity_id = %change.entity_id,
                    clicks = batch.len(),
                    "multi-click detected"
                );
                emit(&batch);
            }
        })
    }
}
