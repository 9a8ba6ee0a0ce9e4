//! Access-control configuration

use chrono::Duration;
use domo_core::{EntityId, DOMAIN_LOCK};
use serde::{Deserialize, Serialize};

use crate::{AccessError, AccessResult};

fn default_suppression_window_secs() -> u64 {
    600
}

fn default_door_close_window_secs() -> u64 {
    300
}

fn default_away_delay_secs() -> u64 {
    60
}

fn default_arrival_sustain_secs() -> u64 {
    30
}

/// One resident's presence trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonConfig {
    pub person_id: String,

    /// Binary sensor that reads on while this person is plausibly home
    pub presence_sensor: EntityId,

    /// How long the presence sensor must hold on before the arrival
    /// counts; filters sensor blips at the perimeter
    #[serde(default = "default_arrival_sustain_secs")]
    pub arrival_sustain_secs: u64,
}

impl PersonConfig {
    pub fn new(person_id: impl Into<String>, presence_sensor: EntityId) -> Self {
        Self {
            person_id: person_id.into(),
            presence_sensor,
            arrival_sustain_secs: default_arrival_sustain_secs(),
        }
    }

    pub fn arrival_sustain(mut self, secs: u64) -> Self {
        self.arrival_sustain_secs = secs;
        self
    }
}

/// Configuration of one suppression controller (one per door)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    pub door_lock: EntityId,
    pub door_contact: EntityId,

    /// Whole-house occupancy sensor; on means occupied
    pub occupancy: EntityId,

    pub persons: Vec<PersonConfig>,

    /// How long after the house becomes occupied further arrivals do not
    /// unlock
    #[serde(default = "default_suppression_window_secs")]
    pub suppression_window_secs: u64,

    /// How long after a door close a departure may still lock
    #[serde(default = "default_door_close_window_secs")]
    pub door_close_window_secs: u64,

    /// How long a presence sensor must stay off before a departure is
    /// believed
    #[serde(default = "default_away_delay_secs")]
    pub away_delay_secs: u64,
}

impl AccessConfig {
    pub fn new(
        door_lock: EntityId,
        door_contact: EntityId,
        occupancy: EntityId,
        persons: Vec<PersonConfig>,
    ) -> Self {
        Self {
            door_lock,
            door_contact,
            occupancy,
            persons,
            suppression_window_secs: default_suppression_window_secs(),
            door_close_window_secs: default_door_close_window_secs(),
            away_delay_secs: default_away_delay_secs(),
        }
    }

    /// Parse and validate a YAML config document
    pub fn from_yaml(raw: &str) -> AccessResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> AccessResult<()> {
        if self.door_lock.domain() != DOMAIN_LOCK {
            return Err(AccessError::InvalidConfig(format!(
                "door_lock must be a lock entity, got {}",
                self.door_lock
            )));
        }
        if self.persons.is_empty() {
            return Err(AccessError::InvalidConfig(
                "at least one person is required".to_string(),
            ));
        }
        let mut ids: Vec<&str> = self.persons.iter().map(|p| p.person_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.persons.len() {
            return Err(AccessError::InvalidConfig(
                "person ids must be unique".to_string(),
            ));
        }
        Ok(())
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::seconds(self.suppression_window_secs as i64)
    }

    pub fn door_close_window(&self) -> Duration {
        Duration::seconds(self.door_close_window_secs as i64)
    }

    pub fn away_delay(&self) -> Duration {
        Duration::seconds(self.away_delay_secs as i64)
    }
}
