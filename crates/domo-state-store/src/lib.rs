//! Current-state tracking for all observed entities
//!
//! The StateStore is the single ingestion point for transitions delivered
//! by the hub connection. It builds each StateChange from the previously
//! stored state, so per-entity contiguity (`old` of change N+1 equals
//! `new` of change N) holds by construction, stores the new state, and
//! publishes the change on the bus. Timer callbacks re-read live state
//! from here rather than trusting values captured at arm time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use domo_core::{Attribution, EntityId, State, StateChange, StateValue};
use domo_event_bus::StateBus;
use tracing::{debug, instrument, trace};

pub struct StateStore {
    states: DashMap<EntityId, State>,
    bus: Arc<StateBus>,
}

impl StateStore {
    pub fn new(bus: Arc<StateBus>) -> Arc<Self> {
        Arc::new(Self {
            states: DashMap::new(),
            bus,
        })
    }

    pub fn bus(&self) -> &Arc<StateBus> {
        &self.bus
    }

    /// Record a transition delivered by the hub and publish it
    ///
    /// `last_changed` of the stored state is preserved when the value is
    /// unchanged, so state age keeps measuring the full run of one value.
    #[instrument(skip(self, value, attributes, attribution), fields(entity_id = %entity_id))]
    pub fn ingest(
        &self,
        entity_id: EntityId,
        value: StateValue,
        attributes: HashMap<String, serde_json::Value>,
        attribution: Attribution,
        timestamp: DateTime<Utc>,
    ) -> StateChange {
        let old = self.states.get(&entity_id).map(|s| s.clone());

        let last_changed = match &old {
            Some(prev) if prev.value == value => prev.last_changed,
            _ => timestamp,
        };
        let new = State::new(value, attributes, last_changed, attribution.clone());

        debug!(
            old = old.as_ref().map(|s| s.value.as_str()).unwrap_or("none"),
            new = %new.value,
            actor = ?attribution.kind(),
            "ingesting state"
        );

        self.states.insert(entity_id.clone(), new.clone());

        let change = StateChange {
            entity_id,
            old,
            new: Some(new),
            timestamp,
            attribution,
        };
        self.bus.publish(&change);
        change
    }

    /// Shorthand for attribute-less transitions
    pub fn ingest_value(
        &self,
        entity_id: EntityId,
        value: StateValue,
        attribution: Attribution,
        timestamp: DateTime<Utc>,
    ) -> StateChange {
        self.ingest(entity_id, value, HashMap::new(), attribution, timestamp)
    }

    /// Forget an entity and publish a change with no new state
    #[instrument(skip(self, attribution), fields(entity_id = %entity_id))]
    pub fn remove(
        &self,
        entity_id: &EntityId,
        attribution: Attribution,
        timestamp: DateTime<Utc>,
    ) -> Option<State> {
        let old = self.states.remove(entity_id).map(|(_, s)| s);

        if let Some(state) = &old {
            trace!(value = %state.value, "removing entity state");
            let change = StateChange {
                entity_id: entity_id.clone(),
                old: Some(state.clone()),
                new: None,
                timestamp,
                attribution,
            };
            self.bus.publish(&change);
        }

        old
    }

    /// The full current state of an entity, if observed
    pub fn get(&self, entity_id: &EntityId) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// The current value of an entity, if observed
    pub fn value_of(&self, entity_id: &EntityId) -> Option<StateValue> {
        self.states.get(entity_id).map(|s| s.value.clone())
    }

    /// Whether an entity currently holds a specific value
    pub fn is_state(&self, entity_id: &EntityId, value: &StateValue) -> bool {
        self.value_of(entity_id).as_ref() == Some(value)
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> Arc<StateStore> {
        StateStore::new(StateBus::new())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ingest_chains_old_and_new() {
        let store = store();
        let entity: EntityId = "binary_sensor.front_door".parse().unwrap();

        let first = store.ingest_value(
            entity.clone(),
            StateValue::Open,
            Attribution::physical(),
            t0(),
        );
        assert!(first.old.is_none());
        assert_eq!(first.new_value(), Some(&StateValue::Open));

        let second = store.ingest_value(
            entity.clone(),
            StateValue::Closed,
            Attribution::physical(),
            t0() + Duration::seconds(10),
        );
        assert_eq!(second.old_value(), Some(&StateValue::Open));
        assert_eq!(second.new_value(), Some(&StateValue::Closed));
    }

    #[test]
    fn test_last_changed_preserved_on_identical_value() {
        let store = store();
        let entity: EntityId = "binary_sensor.hall_motion".parse().unwrap();

        store.ingest_value(entity.clone(), StateValue::On, Attribution::physical(), t0());
        store.ingest_value(
            entity.clone(),
            StateValue::On,
            Attribution::physical(),
            t0() + Duration::seconds(30),
        );

        let state = store.get(&entity).unwrap();
        assert_eq!(state.last_changed, t0());

        store.ingest_value(
            entity.clone(),
            StateValue::Off,
            Attribution::physical(),
            t0() + Duration::seconds(60),
        );
        let state = store.get(&entity).unwrap();
        assert_eq!(state.last_changed, t0() + Duration::seconds(60));
    }

    #[test]
    fn test_ingest_publishes_on_bus() {
        let bus = StateBus::new();
        let store = StateStore::new(bus.clone());
        let entity: EntityId = "switch.guest_mode".parse().unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _handle = bus.subscribe(entity.clone(), move |change| {
            seen_in
                .lock()
                .unwrap()
                .push(change.new_value().cloned());
        });

        store.ingest_value(entity, StateValue::On, Attribution::manual("app_user"), t0());
        assert_eq!(seen.lock().unwrap().as_slice(), &[Some(StateValue::On)]);
    }

    #[test]
    fn test_queries() {
        let store = store();
        let entity: EntityId = "lock.front_door".parse().unwrap();

        assert_eq!(store.value_of(&entity), None);
        store.ingest_value(
            entity.clone(),
            StateValue::Locked,
            Attribution::physical(),
            t0(),
        );

        assert!(store.is_state(&entity, &StateValue::Locked));
        assert!(!store.is_state(&entity, &StateValue::Unlocked));
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn test_remove_publishes_removal() {
        let bus = StateBus::new();
        let store = StateStore::new(bus.clone());
        let entity: EntityId = "sensor.retired".parse().unwrap();

        store.ingest_value(entity.clone(), StateValue::On, Attribution::physical(), t0());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _handle = bus.subscribe(entity.clone(), move |change| {
            seen_in.lock().unwrap().push(change.new.is_none());
        });

        let removed = store.remove(&entity, Attribution::physical(), t0());
        assert!(removed.is_some());
        assert_eq!(store.value_of(&entity), None);
        assert_eq!(seen.lock().unwrap().as_slice(), &[true]);
    }
}
