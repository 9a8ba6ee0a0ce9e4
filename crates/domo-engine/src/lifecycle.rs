//! Toggleable automation lifecycle
//!
//! Every automation instance owns two rule groups: a persistent group
//! built once at start, and a toggleable group that exists only while the
//! master switch reads on. Disabling cancels the whole toggleable group
//! synchronously, including in-flight operator timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domo_core::{EntityId, StateChange, StateValue};
use domo_event_bus::SubscriptionGroup;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{EngineCtx, EngineResult};

/// Per-automation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Boolean entity gating the toggleable rule set
    pub master_switch: EntityId,

    /// Display name for logs; the switch's entity name is used if absent
    #[serde(default)]
    pub alias: Option<String>,
}

impl LifecycleConfig {
    pub fn new(master_switch: EntityId) -> Self {
        Self {
            master_switch,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.master_switch.name())
    }
}

/// One running automation instance
///
/// Dropping the instance shuts it down.
pub struct Lifecycle {
    inner: Arc<Inner>,
}

type RuleBuilder = dyn Fn(&mut SubscriptionGroup) -> EngineResult<()> + Send + Sync;

struct Inner {
    config: LifecycleConfig,
    persistent: Mutex<Option<SubscriptionGroup>>,
    toggleable: Mutex<Option<SubscriptionGroup>>,
    toggleable_rules: Box<RuleBuilder>,
    shut_down: AtomicBool,
}

impl Lifecycle {
    /// Build the persistent group and, if the master switch already reads
    /// on, the toggleable group too
    ///
    /// Rule builders register their reactions into the given group. A
    /// builder failure here is fatal to this automation instance: handles
    /// the failed attempt already registered are cancelled and the error
    /// is returned.
    pub fn start(
        ctx: &EngineCtx,
        config: LifecycleConfig,
        persistent_rules: impl Fn(&mut SubscriptionGroup) -> EngineResult<()> + Send + Sync + 'static,
        toggleable_rules: impl Fn(&mut SubscriptionGroup) -> EngineResult<()> + Send + Sync + 'static,
    ) -> EngineResult<Self> {
        let inner = Arc::new(Inner {
            config,
            persistent: Mutex::new(None),
            toggleable: Mutex::new(None),
            toggleable_rules: Box::new(toggleable_rules),
            shut_down: AtomicBool::new(false),
        });

        // The switch observer lives in the persistent group so the
        // switch's own flips are seen regardless of enablement.
        let mut persistent = SubscriptionGroup::new();
        let weak = Arc::downgrade(&inner);
        persistent.push(
            ctx.bus
                .subscribe(inner.config.master_switch.clone(), move |change| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_master_switch(change);
                    }
                }),
        );
        if let Err(e) = persistent_rules(&mut persistent) {
            persistent.dispose();
            return Err(e);
        }
        *lock(&inner.persistent) = Some(persistent);

        // The switch may already read on at start; no event has to fire.
        if ctx.store.is_state(&inner.config.master_switch, &StateValue::On) {
            if let Err(e) = inner.enable() {
                inner.teardown();
                return Err(e);
            }
        }

        info!(
            automation = inner.config.display_name(),
            master_switch = %inner.config.master_switch,
            enabled = inner.is_enabled(),
            "automation started"
        );
        Ok(Self { inner })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Tear down both groups; idempotent
    pub fn shutdown(&self) {
        self.inner.teardown();
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn is_enabled(&self) -> bool {
        lock(&self.toggleable).is_some()
    }

    fn on_master_switch(&self, change: &StateChange) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        match change.new_value() {
            Some(StateValue::On) => {
                if let Err(e) = self.enable() {
                    // No caller to surface to on a mid-run event; stay
                    // disabled until the next off-to-on cycle.
                    error!(
                        automation = self.config.display_name(),
                        error = %e,
                        "failed to build toggleable rules"
                    );
                }
            }
            Some(StateValue::Off) => self.disable(),
            // Dropouts of the switch itself don't change enablement; the
            // unavailable-to-on recovery lands in the idempotent enable.
            other => {
                debug!(
                    automation = self.config.display_name(),
                    value = other.map(|v| v.as_str()).unwrap_or("none"),
                    "ignoring master switch state"
                );
            }
        }
    }

    fn enable(&self) -> EngineResult<()> {
        let mut guard = lock(&self.toggleable);
        if guard.is_some() {
            debug!(
                automation = self.config.display_name(),
                "already enabled"
            );
            return Ok(());
        }

        let mut group = SubscriptionGroup::new();
        match (self.toggleable_rules)(&mut group) {
            Ok(()) => {
                info!(
                    automation = self.config.display_name(),
                    rules = group.len(),
                    "automation enabled"
                );
                *guard = Some(group);
                Ok(())
            }
            Err(e) => {
                // Cancel whatever the failed build already registered.
                group.dispose();
                Err(e)
            }
        }
    }

    fn disable(&self) {
        if let Some(mut group) = lock(&self.toggleable).take() {
            group.dispose();
            info!(automation = self.config.display_name(), "automation disabled");
        }
    }

    fn teardown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disable();
        if let Some(mut group) = lock(&self.persistent).take() {
            group.dispose();
        }
        info!(automation = self.config.display_name(), "automation shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
