//! The suppression controller

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domo_actuators::ActuatorRegistry;
use domo_core::{Attribution, StateChange, StateValue};
use domo_engine::operators::{
    value_is, EdgeConfig, EdgeTrigger, SustainedConfig, SustainedState,
};
use domo_engine::{EngineCtx, EngineResult, TimerSlot};
use domo_event_bus::SubscriptionGroup;
use tracing::{debug, info, trace, warn};

use crate::config::{AccessConfig, PersonConfig};
use crate::AccessResult;

/// The controller's mutable state; one instance, touched only from its
/// own serialized handlers
#[derive(Debug, Default)]
struct Suppression {
    door_recently_closed: bool,
    house_was_empty: bool,
    unlock_suppressed: bool,
    home: HashMap<String, bool>,
}

enum ArrivalDecision {
    /// First arrival into an empty house; suppression does not apply
    UnlockBypass,
    Unlock,
    Suppressed,
}

/// Decides, per arrival/departure signal, whether to drive the shared
/// door lock
///
/// One controller instance per door. Arrival and departure triggers for
/// every configured person, the door contact, and the house occupancy
/// sensor are all wired through `subscribe`; the handlers mutate the
/// single suppression state and fire the lock actuator. Actuator
/// failures are logged and never retried, and flags are not rolled back:
/// the next event re-derives behavior from live state.
pub struct SuppressionController {
    config: AccessConfig,
    ctx: EngineCtx,
    actuators: Arc<ActuatorRegistry>,
    state: Mutex<Suppression>,
    suppression_timer: TimerSlot,
    door_timer: TimerSlot,
    away_timers: Mutex<HashMap<String, TimerSlot>>,
}

impl SuppressionController {
    pub fn new(
        ctx: &EngineCtx,
        actuators: Arc<ActuatorRegistry>,
        config: AccessConfig,
    ) -> AccessResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            ctx: ctx.clone(),
            actuators,
            state: Mutex::new(Suppression::default()),
            suppression_timer: TimerSlot::new(),
            door_timer: TimerSlot::new(),
            away_timers: Mutex::new(HashMap::new()),
        }))
    }

    /// Register every trigger into `group`
    ///
    /// Shape-compatible with a lifecycle rule builder:
    /// `move |group| controller.subscribe(group)`. Each timer slot is
    /// attached to the handle that arms it, so disposing the group kills
    /// the controller's pending timers too. Re-subscribing resets the
    /// suppression state, so a rebuilt rule set behaves exactly like a
    /// first start.
    pub fn subscribe(self: &Arc<Self>, group: &mut SubscriptionGroup) -> EngineResult<()> {
        self.reset();

        let occupied = value_is(StateValue::On);
        let handle = EdgeTrigger::new(
            self.config.occupancy.clone(),
            occupied.clone(),
            EdgeConfig::falling(),
        )
        .subscribe(&self.ctx, {
            let this = self.clone();
            move |_| this.on_house_empty()
        });
        group.push(handle);

        let handle = EdgeTrigger::new(
            self.config.occupancy.clone(),
            occupied,
            EdgeConfig::rising(),
        )
        .subscribe(&self.ctx, {
            let this = self.clone();
            move |_| this.on_house_occupied()
        });
        handle.attach(Arc::new(self.suppression_timer.clone()));
        group.push(handle);

        let handle = EdgeTrigger::new(
            self.config.door_contact.clone(),
            value_is(StateValue::Closed),
            EdgeConfig::rising(),
        )
        .subscribe(&self.ctx, {
            let this = self.clone();
            move |_| this.on_door_closed()
        });
        handle.attach(Arc::new(self.door_timer.clone()));
        group.push(handle);

        for person in &self.config.persons {
            let present = value_is(StateValue::On);

            let handle = SustainedState::new(
                person.presence_sensor.clone(),
                present.clone(),
                SustainedConfig::new(person.arrival_sustain_secs).ignore_dropouts(),
            )
            .subscribe(&self.ctx, {
                let this = self.clone();
                let person_id = person.person_id.clone();
                move |state| this.on_arrival(&person_id, &state.attribution)
            });
            group.push(handle);

            let handle = EdgeTrigger::new(
                person.presence_sensor.clone(),
                present,
                EdgeConfig::falling(),
            )
            .subscribe(&self.ctx, {
                let this = self.clone();
                let person = person.clone();
                move |change| this.on_presence_lost(&person, change)
            });
            handle.attach(Arc::new(self.away_slot(&person.person_id)));
            group.push(handle);
        }

        info!(
            door_lock = %self.config.door_lock,
            persons = self.config.persons.len(),
            "suppression controller subscribed"
        );
        Ok(())
    }

    // --- Event handlers ---

    fn on_house_empty(&self) {
        {
            let mut state = self.lock_state();
            state.house_was_empty = true;
            // Hard reset of suppression
            state.unlock_suppressed = false;
        }
        self.suppression_timer.cancel();
        info!("house is empty; unlock suppression reset");
    }

    fn on_house_occupied(self: &Arc<Self>) {
        self.lock_state().unlock_suppressed = true;

        let this = self.clone();
        let slot = self.suppression_timer.clone();
        self.suppression_timer.arm(self.ctx.timers.schedule_in(
            self.config.suppression_window(),
            move || {
                slot.clear();
                this.lock_state().unlock_suppressed = false;
                debug!("unlock suppression window elapsed");
            },
        ));
        debug!(
            window_secs = self.config.suppression_window_secs,
            "house occupied; unlock suppression armed"
        );
    }

    fn on_arrival(self: &Arc<Self>, person_id: &str, cause: &Attribution) {
        // The pending departure, if any, is superseded.
        self.away_slot(person_id).cancel();

        let decision = {
            let mut state = self.lock_state();
            state.home.insert(person_id.to_string(), true);
            if state.house_was_empty {
                state.house_was_empty = false;
                ArrivalDecision::UnlockBypass
            } else if state.unlock_suppressed {
                ArrivalDecision::Suppressed
            } else {
                ArrivalDecision::Unlock
            }
        };

        match decision {
            ArrivalDecision::UnlockBypass => {
                info!(person_id, "first arrival into an empty house; unlocking");
                self.drive_lock("unlock", cause);
            }
            ArrivalDecision::Unlock => {
                info!(person_id, "arrival; unlocking");
                self.drive_lock("unlock", cause);
            }
            ArrivalDecision::Suppressed => {
                info!(person_id, "arrival within suppression window; not unlocking");
            }
        }
    }

    fn on_door_closed(self: &Arc<Self>) {
        self.lock_state().door_recently_closed = true;

        // Latest close wins.
        let this = self.clone();
        let slot = self.door_timer.clone();
        self.door_timer.arm(self.ctx.timers.schedule_in(
            self.config.door_close_window(),
            move || {
                slot.clear();
                this.lock_state().door_recently_closed = false;
                trace!("door-close window elapsed");
            },
        ));
        debug!(
            window_secs = self.config.door_close_window_secs,
            "door closed; departure window armed"
        );
    }

    fn on_presence_lost(self: &Arc<Self>, person: &PersonConfig, change: &StateChange) {
        // A sensor dropout is not a departure; only a definite off arms
        // the away delay.
        if change.new_value() != Some(&StateValue::Off) {
            trace!(
                person_id = %person.person_id,
                value = change.new_value().map(|v| v.as_str()).unwrap_or("none"),
                "presence signal lost without a definite off"
            );
            return;
        }

        let slot = self.away_slot(&person.person_id);
        let this = self.clone();
        let person_owned = person.clone();
        let cause = change.attribution.clone();
        let slot_in = slot.clone();
        slot.arm(
            self.ctx
                .timers
                .schedule_in(self.config.away_delay(), move || {
                    slot_in.clear();
                    this.on_away_deadline(&person_owned, &cause);
                }),
        );
        debug!(
            person_id = %person.person_id,
            delay_secs = self.config.away_delay_secs,
            "presence lost; away delay armed"
        );
    }

    fn on_away_deadline(self: &Arc<Self>, person: &PersonConfig, cause: &Attribution) {
        // Only live state counts; the person may have come back, or the
        // sensor may have dropped out, while the delay was pending.
        if !self
            .ctx
            .store
            .is_state(&person.presence_sensor, &StateValue::Off)
        {
            trace!(person_id = %person.person_id, "presence not definitely absent at the away deadline");
            return;
        }

        let should_lock = {
            let mut state = self.lock_state();
            if !state.door_recently_closed {
                // Signal glitch: nobody leaves without the door moving.
                debug!(
                    person_id = %person.person_id,
                    "ignoring departure without a recent door close"
                );
                false
            } else {
                state.home.insert(person.person_id.clone(), false);
                true
            }
        };

        if should_lock {
            info!(person_id = %person.person_id, "departure confirmed; locking");
            self.drive_lock("lock", cause);
        }
    }

    fn drive_lock(&self, action: &str, cause: &Attribution) {
        let attribution = Attribution::automated_from(cause);
        if let Err(e) = self.actuators.invoke(
            &self.config.door_lock,
            action,
            serde_json::json!({}),
            attribution,
        ) {
            // Optimistic: no retry, no flag rollback. The next event
            // re-derives behavior from current actuator state.
            warn!(
                entity_id = %self.config.door_lock,
                action,
                error = %e,
                "lock actuator call failed"
            );
        }
    }

    // --- Introspection ---

    pub fn is_person_home(&self, person_id: &str) -> bool {
        self.lock_state().home.get(person_id).copied().unwrap_or(false)
    }

    pub fn unlock_suppressed(&self) -> bool {
        self.lock_state().unlock_suppressed
    }

    pub fn door_recently_closed(&self) -> bool {
        self.lock_state().door_recently_closed
    }

    pub fn house_was_empty(&self) -> bool {
        self.lock_state().house_was_empty
    }

    // --- Internals ---

    fn away_slot(&self, person_id: &str) -> TimerSlot {
        self.away_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(person_id.to_string())
            .or_default()
            .clone()
    }

    fn reset(&self) {
        self.suppression_timer.cancel();
        self.door_timer.cancel();
        for slot in self
            .away_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            slot.cancel();
        }
        *self.lock_state() = Suppression::default();
    }

    fn lock_state(&self) -> MutexGuard<'_, Suppression> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
