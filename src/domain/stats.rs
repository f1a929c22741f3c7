//! Tally statistics derived from committed history.
//!
//! Days are UTC calendar days. Counter units, not event counts: an
//! adjustment by 3 adds 3 to the increments.

use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::{EventKind, TallyEvent};
use super::tally::TallyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyActivity {
    pub date: NaiveDate,
    pub increments: i64,
    pub decrements: i64,
    pub resets: i64,
}

impl DailyActivity {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            increments: 0,
            decrements: 0,
            resets: 0,
        }
    }

    pub fn total_activity(&self) -> i64 {
        self.increments + self.decrements + self.resets
    }

    pub fn net_change(&self) -> i64 {
        self.increments - self.decrements
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyActivity {
    /// Start of the hour
    pub hour: DateTime<Utc>,
    pub increments: i64,
    pub decrements: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyStats {
    pub tally_id: TallyId,
    pub current_count: i64,
    pub total_increments: i64,
    pub total_decrements: i64,
    pub reset_count: i64,
    /// Highest value the counter reached, replaying history from its start
    pub highest_count: i64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Oldest day first, only days with activity
    pub daily_activity: Vec<DailyActivity>,
    /// The 24 hours before the stats were computed, oldest first
    pub hourly_activity: Vec<HourlyActivity>,
}

impl TallyStats {
    /// Stats for a tally currently at `current_count` with `events` (any order).
    pub fn from_events(tally_id: TallyId, current_count: i64, events: &[TallyEvent], now: DateTime<Utc>) -> Self {
        let mut ordered: Vec<&TallyEvent> = events.iter().filter(|e| e.tally_id == tally_id).collect();
        ordered.sort_by_key(|e| e.timestamp);

        let net: i64 = ordered.iter().map(|e| e.delta).sum();
        let mut running = (current_count - net).max(0);
        let mut highest = running.max(current_count);

        let mut stats = Self {
            tally_id,
            current_count,
            total_increments: 0,
            total_decrements: 0,
            reset_count: 0,
            highest_count: 0,
            first_activity: ordered.first().map(|e| e.timestamp),
            last_activity: ordered.last().map(|e| e.timestamp),
            daily_activity: Vec::new(),
            hourly_activity: Vec::new(),
        };

        let mut days: BTreeMap<NaiveDate, DailyActivity> = BTreeMap::new();
        let mut hours: BTreeMap<DateTime<Utc>, HourlyActivity> = BTreeMap::new();
        let window_start = now - Duration::hours(24);

        for event in ordered {
            running = (running + event.delta).max(0);
            highest = highest.max(running);

            let day = days
                .entry(event.timestamp.date_naive())
                .or_insert_with(|| DailyActivity::new(event.timestamp.date_naive()));
            let (up, down) = match event.kind {
                EventKind::Reset => {
                    stats.reset_count += 1;
                    day.resets += 1;
                    (0, 0)
                }
                _ if event.delta > 0 => (event.delta, 0),
                _ => (0, -event.delta),
            };
            stats.total_increments += up;
            stats.total_decrements += down;
            day.increments += up;
            day.decrements += down;

            if event.timestamp > window_start && event.timestamp <= now {
                let hour = event
                    .timestamp
                    .duration_trunc(Duration::hours(1))
                    .unwrap_or(event.timestamp);
                let slot = hours.entry(hour).or_insert(HourlyActivity {
                    hour,
                    increments: 0,
                    decrements: 0,
                });
                slot.increments += up;
                slot.decrements += down;
            }
        }

        stats.highest_count = highest;
        stats.daily_activity = days.into_values().collect();
        stats.hourly_activity = hours.into_values().collect();
        stats
    }

    pub fn total_interactions(&self) -> i64 {
        self.total_increments + self.total_decrements + self.reset_count
    }

    /// Increments minus decrements; resets are not counted.
    pub fn net_change(&self) -> i64 {
        self.total_increments - self.total_decrements
    }

    pub fn average_increments_per_day(&self, now: DateTime<Utc>) -> f64 {
        match self.first_activity {
            Some(first) => {
                let days = (now - first).num_days().max(1);
                self.total_increments as f64 / days as f64
            }
            None => 0.0,
        }
    }

    /// Consecutive days with at least one increment, ending `today`.
    pub fn current_streak(&self, today: NaiveDate) -> u32 {
        let mut streak = 0;
        let mut day = today;
        for activity in self.daily_activity.iter().rev().filter(|a| a.increments > 0) {
            if activity.date > day {
                continue;
            }
            if activity.date != day {
                break;
            }
            streak += 1;
            match day.pred_opt() {
                Some(previous) => day = previous,
                None => break,
            }
        }
        streak
    }

    /// Longest run of consecutive days with at least one increment.
    pub fn longest_streak(&self) -> u32 {
        let mut longest = 0;
        let mut current = 0;
        let mut previous: Option<NaiveDate> = None;
        for activity in self.daily_activity.iter().filter(|a| a.increments > 0) {
            current = match previous {
                Some(p) if p.succ_opt() == Some(activity.date) => current + 1,
                _ => 1,
            };
            longest = longest.max(current);
            previous = Some(activity.date);
        }
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn event(id: TallyId, kind: EventKind, delta: i64, timestamp: DateTime<Utc>) -> TallyEvent {
        TallyEvent {
            tally_id: id,
            kind,
            delta,
            timestamp,
        }
    }

    #[test]
    fn test_totals_and_highest() {
        let id = TallyId::new();
        let events = vec![
            event(id, EventKind::Increment, 1, at(1, 8)),
            event(id, EventKind::Increment, 1, at(1, 9)),
            event(id, EventKind::Set, 3, at(2, 10)),
            event(id, EventKind::Decrement, -1, at(2, 11)),
            event(id, EventKind::Reset, -4, at(3, 12)),
            event(id, EventKind::Increment, 1, at(3, 13)),
        ];

        let stats = TallyStats::from_events(id, 1, &events, at(3, 14));
        assert_eq!(stats.total_increments, 6);
        assert_eq!(stats.total_decrements, 1);
        assert_eq!(stats.reset_count, 1);
        assert_eq!(stats.highest_count, 5);
        assert_eq!(stats.total_interactions(), 8);
        assert_eq!(stats.net_change(), 5);
        assert_eq!(stats.first_activity, Some(at(1, 8)));
        assert_eq!(stats.last_activity, Some(at(3, 13)));
        assert_eq!(stats.daily_activity.len(), 3);
        assert_eq!(stats.daily_activity[1].net_change(), 2);
        // Only the 24 hours before 3rd 14:00 count
        assert_eq!(stats.hourly_activity.len(), 2);
        assert_eq!(stats.hourly_activity[0].hour, at(3, 12));
        assert_eq!(stats.hourly_activity[1].increments, 1);
    }

    #[test]
    fn test_streaks() {
        let id = TallyId::new();
        let events: Vec<_> = [1, 2, 3, 5, 6]
            .into_iter()
            .map(|day| event(id, EventKind::Increment, 1, at(day, 9)))
            .chain([event(id, EventKind::Decrement, -1, at(7, 9))])
            .collect();

        let stats = TallyStats::from_events(id, 4, &events, at(7, 10));
        assert_eq!(stats.longest_streak(), 3);
        assert_eq!(stats.current_streak(at(6, 0).date_naive()), 2);
        // A decrement alone does not keep the streak alive
        assert_eq!(stats.current_streak(at(7, 0).date_naive()), 0);
    }

    #[test]
    fn test_no_history() {
        let id = TallyId::new();
        let stats = TallyStats::from_events(id, 7, &[], at(1, 0));
        assert_eq!(stats.highest_count, 7);
        assert_eq!(stats.first_activity, None);
        assert_eq!(stats.average_increments_per_day(at(1, 0)), 0.0);
        assert_eq!(stats.longest_streak(), 0);
    }
}
