//! Sustained-state detection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use domo_core::{EntityId, State};
use domo_event_bus::SubscriptionHandle;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::StatePredicate;
use crate::{EngineCtx, TimerSlot};

/// Parameters for sustained-state detection
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SustainedConfig {
    /// How long the predicate must hold before emitting
    pub duration_secs: u64,

    /// Credit the current state's age at subscribe time instead of
    /// waiting for the next qualifying transition
    #[serde(default)]
    pub start_immediately: bool,

    /// Keep a pending run alive across unavailable/unknown transitions
    /// instead of treating them as breaking the sustain
    #[serde(default)]
    pub ignore_dropouts: bool,
}

impl SustainedConfig {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            duration_secs,
            start_immediately: false,
            ignore_dropouts: false,
        }
    }

    pub fn start_immediately(mut self) -> Self {
        self.start_immediately = true;
        self
    }

    pub fn ignore_dropouts(mut self) -> Self {
        self.ignore_dropouts = true;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs as i64)
    }
}

/// Emits once when a predicate has held continuously for a duration
///
/// Leaving the predicate before the deadline cancels the pending emission;
/// it must not fire late. The deadline callback re-reads live state at
/// fire time, so an emission never trusts a value captured when the timer
/// was armed. At most one emission per qualifying run: after emitting, the
/// predicate has to stop holding before a new run can start.
pub struct SustainedState {
    entity_id: EntityId,
    predicate: StatePredicate,
    config: SustainedConfig,
}

impl SustainedState {
    pub fn new(entity_id: EntityId, predicate: StatePredicate, config: SustainedConfig) -> Self {
        Self {
            entity_id,
            predicate,
            config,
        }
    }

    /// Subscribe; `emit` receives the live state once it has sustained
    pub fn subscribe<F>(self, ctx: &EngineCtx, emit: F) -> SubscriptionHandle
    where
        F: Fn(&State) + Send + Sync + 'static,
    {
        let Self {
            entity_id,
            predicate,
            config,
        } = self;
        let emit = Arc::new(emit);
        let slot = TimerSlot::new();
        let in_run = Arc::new(AtomicBool::new(false));
        let duration = config.duration();

        let arm = {
            let entity_id = entity_id.clone();
            let predicate = predicate.clone();
            let slot = slot.clone();
            let in_run = in_run.clone();
            let store = ctx.store.clone();
            let timers = ctx.timers.clone();
            Arc::new(move |delay: Duration| {
                let entity_id = entity_id.clone();
                let predicate = predicate.clone();
                let slot_in = slot.clone();
                let in_run = in_run.clone();
                let store = store.clone();
                let emit = emit.clone();
                slot.arm(timers.schedule_in(delay, move || {
                    slot_in.clear();
                    // The predicate may have stopped holding between
                    // scheduling and delivery; only live state counts.
                    match store.get(&entity_id) {
                        Some(state) if predicate(&state.value) => {
                            debug!(entity_id = %entity_id, value = %state.value, "state sustained");
                            emit(&state);
                        }
                        _ => {
                            trace!(entity_id = %entity_id, "sustain deadline reached but predicate no longer holds");
                            // The run is over; a recovery starts fresh.
                            in_run.store(false, Ordering::SeqCst);
                        }
                    }
                }));
            })
        };

        if config.start_immediately {
            if let Some(state) = ctx.store.get(&entity_id) {
                if predicate(&state.value) {
                    let remaining =
                        (duration - state.age(ctx.clock.now())).max(Duration::zero());
                    trace!(entity_id = %entity_id, "starting sustain from current state");
                    in_run.store(true, Ordering::SeqCst);
                    arm(remaining);
                }
            }
        }

        let handle = ctx.bus.subscribe(entity_id, {
            let slot = slot.clone();
            let arm = arm.clone();
            move |change| {
                let new_ok = change.new_value().map(|v| predicate(v)).unwrap_or(false);
                if !new_ok {
                    let dropout = change
                        .new_value()
                        .map(|v| v.is_indeterminate())
                        .unwrap_or(false);
                    if dropout && config.ignore_dropouts && in_run.load(Ordering::SeqCst) {
                        trace!(entity_id = %change.entity_id, "ignoring sensor dropout during sustain");
                        return;
                    }
                    if in_run.swap(false, Ordering::SeqCst) {
                        trace!(entity_id = %change.entity_id, "sustain broken");
                        slot.cancel();
                    }
                    return;
                }

                let old_ok = change.old_value().map(|v| predicate(v)).unwrap_or(false);
                if !old_ok && !in_run.load(Ordering::SeqCst) {
                    trace!(entity_id = %change.entity_id, "sustain run started");
                    in_run.store(true, Ordering::SeqCst);
                    arm(duration);
                }
            }
        });
        handle.attach(Arc::new(slot));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::value_is;
    use crate::ManualClock;
    use chrono::{TimeZone, Utc};
    use domo_core::{Attribution, StateValue};
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (EngineCtx, ManualClock, EntityId) {
        let (ctx, clock) = EngineCtx::manual(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (ctx, clock, "binary_sensor.hall_motion".parse().unwrap())
    }

    fn ingest(ctx: &EngineCtx, entity: &EntityId, value: StateValue) {
        ctx.store.ingest_value(
            entity.clone(),
            value,
            Attribution::physical(),
            ctx.clock.now(),
        );
    }

    fn advance(ctx: &EngineCtx, clock: &ManualClock, secs: i64) {
        clock.advance(Duration::seconds(secs));
        ctx.pump();
    }

    fn counting_subscribe(
        ctx: &EngineCtx,
        entity: &EntityId,
        config: SustainedConfig,
    ) -> (SubscriptionHandle, Arc<AtomicUsize>) {
        let emissions = Arc::new(AtomicUsize::new(0));
        let emissions_in = emissions.clone();
        let handle = SustainedState::new(entity.clone(), value_is(StateValue::On), config)
            .subscribe(ctx, move |_| {
                emissions_in.fetch_add(1, Ordering::SeqCst);
            });
        (handle, emissions)
    }

    #[test]
    fn test_emits_after_duration() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 29);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);

        advance(&ctx, &clock, 1);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_break_before_duration_cancels() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 10);
        ingest(&ctx, &entity, StateValue::Off);

        // Even long after the original deadline, nothing fires.
        advance(&ctx, &clock, 120);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_at_most_once_per_run() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 30);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);

        // Repeated identical reports within the same run change nothing.
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 120);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);

        // A fresh run after a break emits again.
        ingest(&ctx, &entity, StateValue::Off);
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 30);
        assert_eq!(emissions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_repeated_report_does_not_restart_timer() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 20);
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 10);

        // 30s since the run started, even though a report arrived at 20s.
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropout_breaks_by_default() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 10);
        ingest(&ctx, &entity, StateValue::Unavailable);
        advance(&ctx, &clock, 20);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);

        // Recovery re-arms the full duration.
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 30);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropout_ignored_when_configured() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(
            &ctx,
            &entity,
            SustainedConfig::new(30).ignore_dropouts(),
        );

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 10);
        ingest(&ctx, &entity, StateValue::Unavailable);
        advance(&ctx, &clock, 5);
        ingest(&ctx, &entity, StateValue::On);

        // The original deadline stands: 30s after the run began.
        advance(&ctx, &clock, 15);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_immediately_credits_state_age() {
        let (ctx, clock, entity) = setup();

        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 20);

        let (_handle, emissions) = counting_subscribe(
            &ctx,
            &entity,
            SustainedConfig::new(30).start_immediately(),
        );
        advance(&ctx, &clock, 10);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_without_start_immediately_waits_for_transition() {
        let (ctx, clock, entity) = setup();

        ingest(&ctx, &entity, StateValue::On);
        let (_handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        advance(&ctx, &clock, 120);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);

        ingest(&ctx, &entity, StateValue::Off);
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 30);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_handle_stops_pending_emission() {
        let (ctx, clock, entity) = setup();
        let (handle, emissions) = counting_subscribe(&ctx, &entity, SustainedConfig::new(30));

        ingest(&ctx, &entity, StateValue::On);
        // The deadline elapses in wall-clock terms, then the handle is
        // cancelled before the timer is delivered.
        clock.advance(Duration::seconds(45));
        handle.cancel();
        ctx.pump();

        assert_eq!(emissions.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.timers.pending_count(), 0);
    }

    #[test]
    fn test_deadline_rereads_live_state() {
        let (ctx, clock, entity) = setup();
        let (_handle, emissions) = counting_subscribe(
            &ctx,
            &entity,
            SustainedConfig::new(30).ignore_dropouts(),
        );

        // A dropout that spans the deadline: the timer stays armed, but
        // the live state at fire time does not qualify.
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 10);
        ingest(&ctx, &entity, StateValue::Unavailable);
        advance(&ctx, &clock, 20);
        assert_eq!(emissions.load(Ordering::SeqCst), 0);

        // Recovery after the missed deadline starts a fresh run.
        ingest(&ctx, &entity, StateValue::On);
        advance(&ctx, &clock, 30);
        assert_eq!(emissions.load(Ordering::SeqCst), 1);
    }
}
