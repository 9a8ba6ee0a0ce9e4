//! Entity state values and the State record

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Attribution;

/// A domain state value as reported by the hub
///
/// The closed set covers every binary/lock/contact state the engine reasons
/// about; anything else (numeric sensor readings, free-form text) is carried
/// through as `Other` so no hub payload is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StateValue {
    On,
    Off,
    Open,
    Closed,
    Locked,
    Unlocked,
    Unavailable,
    Unknown,
    Other(String),
}

impl StateValue {
    /// Parse a raw hub state string
    pub fn parse(s: &str) -> Self {
        match s {
            "on" => Self::On,
            "off" => Self::Off,
            "open" => Self::Open,
            "closed" => Self::Closed,
            "locked" => Self::Locked,
            "unlocked" => Self::Unlocked,
            "unavailable" => Self::Unavailable,
            "unknown" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    /// The raw hub string form
    pub fn as_str(&self) -> &str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
            Self::Other(s) => s,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// True for the two states that mean "the sensor told us nothing"
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Unknown)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<StateValue> for String {
    fn from(v: StateValue) -> String {
        v.as_str().to_string()
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state of one entity at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The state value (e.g. `on`, `locked`, `23.5`)
    pub value: StateValue,

    /// Additional attributes reported alongside the value
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the value last changed to something different
    pub last_changed: DateTime<Utc>,

    /// Who produced this state
    pub attribution: Attribution,
}

impl State {
    pub fn new(
        value: StateValue,
        attributes: HashMap<String, serde_json::Value>,
        last_changed: DateTime<Utc>,
        attribution: Attribution,
    ) -> Self {
        Self {
            value,
            attributes,
            last_changed,
            attribution,
        }
    }

    /// A state with no attributes
    pub fn bare(value: StateValue, last_changed: DateTime<Utc>, attribution: Attribution) -> Self {
        Self::new(value, HashMap::new(), last_changed, attribution)
    }

    /// Deserialize an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// How long the current value has held, as seen from `now`
    ///
    /// Never negative, even if `now` lags `last_changed` slightly.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_changed).max(Duration::zero())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and attribution are not part of state identity
        self.value == other.value && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_state_value_parse() {
        assert_eq!(StateValue::parse("on"), StateValue::On);
        assert_eq!(StateValue::parse("locked"), StateValue::Locked);
        assert_eq!(
            StateValue::parse("23.5"),
            StateValue::Other("23.5".to_string())
        );
    }

    #[test]
    fn test_state_value_round_trip() {
        for raw in ["on", "off", "open", "closed", "unavailable", "17"] {
            assert_eq!(StateValue::parse(raw).as_str(), raw);
        }
    }

    #[test]
    fn test_indeterminate() {
        assert!(StateValue::Unavailable.is_indeterminate());
        assert!(StateValue::Unknown.is_indeterminate());
        assert!(!StateValue::Off.is_indeterminate());
    }

    #[test]
    fn test_state_value_serde_is_plain_string() {
        let v: StateValue = serde_json::from_str("\"unlocked\"").unwrap();
        assert_eq!(v, StateValue::Unlocked);
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"unlocked\"");
    }

    #[test]
    fn test_attribute_accessor() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut attributes = HashMap::new();
        attributes.insert("brightness".to_string(), json!(128));
        let state = State::new(StateValue::On, attributes, at, Attribution::physical());

        assert_eq!(state.attribute::<u32>("brightness"), Some(128));
        assert_eq!(state.attribute::<u32>("missing"), None);
    }

    #[test]
    fn test_age_is_clamped() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let state = State::bare(StateValue::On, at, Attribution::physical());

        let later = at + Duration::seconds(90);
        assert_eq!(state.age(later), Duration::seconds(90));

        let earlier = at - Duration::seconds(5);
        assert_eq!(state.age(earlier), Duration::zero());
    }

    #[test]
    fn test_state_equality_ignores_timestamps() {
        let a = State::bare(
            StateValue::On,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Attribution::physical(),
        );
        let b = State::bare(
            StateValue::On,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            Attribution::unknown(),
        );
        assert_eq!(a, b);
    }
}
