//! Access-control suppression state machine
//!
//! Coordinates several independent person-presence triggers against one
//! shared door lock: arrivals unlock unless a suppression window is
//! active (no unlock storms when a household comes home together),
//! departures lock only when the door actually closed recently, and an
//! empty house bypasses suppression for the first arrival. All timing is
//! built out of the engine's operators and cancellable timers.

mod config;
mod controller;

pub use config::{AccessConfig, PersonConfig};
pub use controller::SuppressionController;

use thiserror::Error;

/// Result type for access-control operations
pub type AccessResult<T> = Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid access config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Engine(#[from] domo_engine::EngineError),
}
