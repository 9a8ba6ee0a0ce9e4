//! Daily schedule validation
//!
//! The engine does not own a cron scheduler; an external collaborator
//! fires callbacks at the instants this module computes. What lives here
//! is the config validation (a bad entry is skipped with a warning, the
//! rest proceed) and the next-occurrence arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One daily fire time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Identifies the callback to the external scheduler
    pub label: String,

    pub hour: u32,

    #[serde(default)]
    pub minute: u32,
}

impl ScheduleEntry {
    pub fn new(label: impl Into<String>, hour: u32, minute: u32) -> Self {
        Self {
            label: label.into(),
            hour,
            minute,
        }
    }
}

/// A validated, time-ordered list of daily fire times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule {
    entries: Vec<ScheduleEntry>,
}

impl DailySchedule {
    /// Keep the in-range entries, skipping the rest with a warning
    pub fn build(entries: Vec<ScheduleEntry>) -> Self {
        let mut entries: Vec<ScheduleEntry> = entries
            .into_iter()
            .filter(|entry| {
                let valid = entry.hour < 24 && entry.minute < 60;
                if !valid {
                    warn!(
                        label = %entry.label,
                        hour = entry.hour,
                        minute = entry.minute,
                        "skipping out-of-range schedule entry"
                    );
                }
                valid
            })
            .collect();
        entries.sort_by_key(|entry| (entry.hour, entry.minute));
        Self { entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The next fire instant strictly after `now`, with its entry
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, &ScheduleEntry)> {
        let today = now.date_naive();
        for entry in &self.entries {
            let at = today.and_hms_opt(entry.hour, entry.minute, 0)?.and_utc();
            if at > now {
                return Some((at, entry));
            }
        }
        let first = self.entries.first()?;
        let at = today
            .succ_opt()?
            .and_hms_opt(first.hour, first.minute, 0)?
            .and_utc();
        Some((at, first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_out_of_range_entries_are_skipped() {
        let schedule = DailySchedule::build(vec![
            ScheduleEntry::new("morning", 7, 30),
            ScheduleEntry::new("bad_hour", 24, 0),
            ScheduleEntry::new("bad_minute", 3, 60),
            ScheduleEntry::new("midnight", 0, 0),
        ]);

        let labels: Vec<&str> = schedule
            .entries()
            .iter()
            .map(|e| e.label.as_str())
            .collect();
        assert_eq!(labels, vec!["midnight", "morning"]);
    }

    #[test]
    fn test_next_after_same_day() {
        let schedule = DailySchedule::build(vec![
            ScheduleEntry::new("morning", 7, 30),
            ScheduleEntry::new("evening", 22, 0),
        ]);

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let (at, entry) = schedule.next_after(now).unwrap();
        assert_eq!(entry.label, "evening");
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_next_after_wraps_to_tomorrow() {
        let schedule = DailySchedule::build(vec![ScheduleEntry::new("morning", 7, 30)]);

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let (at, entry) = schedule.next_after(now).unwrap();
        assert_eq!(entry.label, "morning");
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 2, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_exact_instant_is_not_next() {
        let schedule = DailySchedule::build(vec![ScheduleEntry::new("morning", 7, 30)]);

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 7, 30, 0).unwrap();
        let (at, _) = schedule.next_after(now).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 2, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_empty_schedule_has_no_next() {
        let schedule = DailySchedule::build(vec![ScheduleEntry::new("bad", 99, 0)]);
        assert!(schedule.is_empty());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(schedule.next_after(now).is_none());
    }

    #[test]
    fn test_deserializes_with_default_minute() {
        let entry: ScheduleEntry =
            serde_json::from_str(r#"{"label": "cache_reset", "hour": 3}"#).unwrap();
        assert_eq!(entry, ScheduleEntry::new("cache_reset", 3, 0));
    }
}
