//! Per-entity pub/sub of state changes
//!
//! The StateBus is the delivery point between the hub connection and the
//! rules built on top of it. Delivery is synchronous and in registration
//! order: `publish` invokes every live subscription for the changed entity
//! on the caller's thread before returning, which is what keeps rule
//! handlers serialized with respect to each other.

use dashmap::DashMap;
use domo_core::{EntityId, StateChange};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, trace};

/// Anything that can be cancelled alongside a subscription
///
/// Timer handles and timer slots implement this so that cancelling a
/// subscription also kills any delayed work the reaction scheduled.
pub trait Cancel: Send + Sync {
    fn cancel(&self);
}

/// A unique identifier for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    handler: Arc<dyn Fn(&StateChange) + Send + Sync>,
    live: Arc<AtomicBool>,
}

/// The bus for publishing and subscribing to per-entity state changes
pub struct StateBus {
    /// Subscription ids per entity, in registration order
    subscribers: DashMap<EntityId, Vec<SubscriptionId>>,
    /// Handler registrations by subscription id
    registrations: DashMap<SubscriptionId, Registration>,
    /// Counter for generating unique subscription ids
    next_id: AtomicU64,
}

impl StateBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            registrations: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to state changes of one entity
    ///
    /// The returned handle cancels the subscription when dropped, so the
    /// caller (usually a SubscriptionGroup) must keep it alive.
    pub fn subscribe(
        self: &Arc<Self>,
        entity_id: EntityId,
        handler: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let live = Arc::new(AtomicBool::new(true));

        trace!(entity_id = %entity_id, subscription = id.0, "subscribing");

        self.registrations.insert(
            id,
            Registration {
                handler: Arc::new(handler),
                live: live.clone(),
            },
        );
        self.subscribers
            .entry(entity_id.clone())
            .or_default()
            .push(id);

        SubscriptionHandle {
            id,
            entity_id,
            bus: Arc::downgrade(self),
            live,
            attached: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a change to every live subscription for its entity
    ///
    /// Handlers run synchronously on the caller's thread, in registration
    /// order. A subscription cancelled after `publish` started but before
    /// its turn is skipped.
    pub fn publish(&self, change: &StateChange) {
        let ids = match self.subscribers.get(&change.entity_id) {
            Some(entry) => entry.clone(),
            None => return,
        };

        trace!(
            entity_id = %change.entity_id,
            subscribers = ids.len(),
            "publishing state change"
        );

        for id in ids {
            // Clone out of the map so handlers can subscribe/cancel
            // without deadlocking against the shard lock.
            let Some((handler, live)) = self
                .registrations
                .get(&id)
                .map(|r| (r.handler.clone(), r.live.clone()))
            else {
                continue;
            };
            if live.load(Ordering::SeqCst) {
                handler(change);
            }
        }
    }

    /// Number of live subscriptions for one entity
    pub fn subscriber_count(&self, entity_id: &EntityId) -> usize {
        self.subscribers
            .get(entity_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Total number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registrations.len()
    }

    fn unsubscribe(&self, entity_id: &EntityId, id: SubscriptionId) {
        self.registrations.remove(&id);
        if let Some(mut ids) = self.subscribers.get_mut(entity_id) {
            ids.retain(|other| *other != id);
        }
        trace!(entity_id = %entity_id, subscription = id.0, "unsubscribed");
    }
}

/// Cancellable token for one registered reaction
///
/// Cancelling stops any further callback invocations and cancels every
/// timer the reaction attached. Cancel is idempotent; dropping the handle
/// cancels it.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    entity_id: EntityId,
    bus: Weak<StateBus>,
    live: Arc<AtomicBool>,
    attached: Mutex<Vec<Arc<dyn Cancel>>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Tie a cancellable token (e.g. a timer slot) to this subscription
    pub fn attach(&self, token: Arc<dyn Cancel>) {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.live.load(Ordering::SeqCst)
    }

    /// Stop all further callback invocations and kill attached timers
    pub fn cancel(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(&self.entity_id, self.id);
            }
            let tokens = std::mem::take(
                &mut *self
                    .attached
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            for token in tokens {
                token.cancel();
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// An unordered set of subscriptions that is torn down together
///
/// Disposal cancels every handle exactly once; disposing again is a no-op.
/// Dropping the group disposes it.
#[derive(Default)]
pub struct SubscriptionGroup {
    handles: Vec<SubscriptionHandle>,
    disposed: bool,
}

impl SubscriptionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle; a disposed group cancels it immediately
    pub fn push(&mut self, handle: SubscriptionHandle) {
        if self.disposed {
            handle.cancel();
        } else {
            self.handles.push(handle);
        }
    }

    /// Cancel every handle in the group; at most once
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        debug!(handles = self.handles.len(), "disposing subscription group");
        for handle in self.handles.drain(..) {
            handle.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for SubscriptionGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}
