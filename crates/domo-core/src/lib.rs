//! Core types for the domo rules engine
//!
//! This crate provides the fundamental types every other crate builds on:
//! EntityId, StateValue, State, StateChange, and Attribution.

mod attribution;
mod change;
mod entity_id;
mod state;

pub use attribution::{ActorKind, Attribution};
pub use change::StateChange;
pub use entity_id::{EntityId, EntityIdError};
pub use state::{State, StateValue};

/// Entity domain used by door locks
pub const DOMAIN_LOCK: &str = "lock";

/// Entity domain used by binary sensors (presence, occupancy, contact)
pub const DOMAIN_BINARY_SENSOR: &str = "binary_sensor";

/// Entity domain used by master switches
pub const DOMAIN_SWITCH: &str = "switch";
