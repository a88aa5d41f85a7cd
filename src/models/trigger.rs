// Time triggers and their schedules

//! # Time Trigger Module
//!
//! A time trigger runs a list of actions when its `next_execution` instant is reached. The
//! schedule decides how `next_execution` moves forward after every fire.
//!
//! ## Schedule Kinds
//!
//! | `schedule_type` | `schedule_data`                       | After firing                         |
//! |-----------------|---------------------------------------|--------------------------------------|
//! | `scheduled`     | `{hour, minute}` or `{at}`            | next hour:minute, or idle for `at`   |
//! | `cyclic`        | `{interval_seconds}` (default 3600)   | `now + interval_seconds`             |
//! | `duration`      | `{duration_seconds}` (default 3600)   | `now + duration_seconds`             |
//! | `sequential`    | `{times, next_index}`                 | next listed instant, then idle       |
//! | `delayed`       | `{delay_seconds}`                     | idle                                 |
//!
//! An idle trigger keeps `next_execution = None` and never fires again until it is
//! re-registered.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::action::Action;

const DEFAULT_PERIOD_SECONDS: u64 = 3600;

/// Longest interval, duration or delay a schedule accepts: ten years
pub const MAX_PERIOD_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Schedule of a time trigger, serialized as `schedule_type` + `schedule_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", content = "schedule_data", rename_all = "snake_case")]
pub enum Schedule {
    /// Daily at `hour:minute` (UTC), or once at the absolute instant `at`
    Scheduled {
        #[serde(default)]
        hour: Option<u32>,
        #[serde(default)]
        minute: Option<u32>,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },

    /// Fires every `duration_seconds`, one hour when unspecified
    Duration {
        #[serde(default)]
        duration_seconds: Option<u64>,
    },

    /// Fires every `interval_seconds`
    Cyclic {
        #[serde(default = "default_interval")]
        interval_seconds: u64,
    },

    /// Fires once at each listed instant, in order
    Sequential {
        times: Vec<DateTime<Utc>>,
        #[serde(default)]
        next_index: usize,
    },

    /// Fires once, `delay_seconds` after registration
    Delayed { delay_seconds: u64 },
}

fn default_interval() -> u64 {
    DEFAULT_PERIOD_SECONDS
}

impl Schedule {
    pub fn cyclic(interval_seconds: u64) -> Self {
        Schedule::Cyclic { interval_seconds }
    }

    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Schedule::Scheduled {
            hour: Some(hour),
            minute: Some(minute),
            at: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Scheduled { .. } => "scheduled",
            Schedule::Duration { .. } => "duration",
            Schedule::Cyclic { .. } => "cyclic",
            Schedule::Sequential { .. } => "sequential",
            Schedule::Delayed { .. } => "delayed",
        }
    }

    /// Reject schedules that can never produce a sensible instant
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Schedule::Scheduled { hour, minute, at } => {
                if at.is_some() {
                    return Ok(());
                }
                match (hour, minute) {
                    (Some(h), m) if *h < 24 && m.unwrap_or(0) < 60 => Ok(()),
                    (Some(_), _) => Err("scheduled trigger needs hour < 24 and minute < 60".to_string()),
                    (None, _) => Err("scheduled trigger needs either `at` or `hour`".to_string()),
                }
            }
            Schedule::Cyclic { interval_seconds } if *interval_seconds == 0 => {
                Err("cyclic trigger needs a positive interval_seconds".to_string())
            }
            Schedule::Duration { duration_seconds: Some(0) } => {
                Err("duration trigger needs a positive duration_seconds".to_string())
            }
            Schedule::Cyclic { interval_seconds: period }
            | Schedule::Duration { duration_seconds: Some(period) }
            | Schedule::Delayed { delay_seconds: period }
                if *period > MAX_PERIOD_SECONDS =>
            {
                Err(format!("{} trigger period must not exceed {} seconds", self.kind(), MAX_PERIOD_SECONDS))
            }
            _ => Ok(()),
        }
    }

    /// First execution instant, computed when the trigger is registered
    ///
    /// Instants in the past are clamped to `now`, so the trigger fires on the next tick.
    pub fn first_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Scheduled { at: Some(at), .. } => Some((*at).max(now)),
            Schedule::Scheduled { hour, minute, .. } => {
                next_daily_occurrence(now, (*hour)?, minute.unwrap_or(0))
            }
            Schedule::Duration { duration_seconds } => {
                after(now, duration_seconds.unwrap_or(DEFAULT_PERIOD_SECONDS))
            }
            Schedule::Cyclic { interval_seconds } => after(now, *interval_seconds),
            Schedule::Sequential { times, next_index } => {
                times.get(*next_index).map(|t| (*t).max(now))
            }
            Schedule::Delayed { delay_seconds } => after(now, *delay_seconds),
        }
    }

    /// Move the schedule past a fire at `now` and return the following execution instant
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Scheduled { at: Some(_), .. } => None,
            Schedule::Scheduled { hour, minute, .. } => {
                next_daily_occurrence(now, (*hour)?, minute.unwrap_or(0))
            }
            Schedule::Duration { duration_seconds } => {
                after(now, duration_seconds.unwrap_or(DEFAULT_PERIOD_SECONDS))
            }
            Schedule::Cyclic { interval_seconds } => after(now, *interval_seconds),
            Schedule::Sequential { times, next_index } => {
                *next_index += 1;
                times.get(*next_index).map(|t| (*t).max(now))
            }
            Schedule::Delayed { .. } => None,
        }
    }
}

/// `now + seconds`, or `None` when the instant is not representable
fn after(now: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_seconds(i64::try_from(seconds).ok()?)?;
    now.checked_add_signed(delta)
}

/// Next `hour:minute` strictly after `now`, rolling over to the following day
fn next_daily_occurrence(now: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(time));
    if today > now {
        Some(today)
    } else {
        today.checked_add_signed(Duration::days(1))
    }
}

/// A trigger that runs actions on a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeTrigger {
    pub id: String,

    #[serde(flatten)]
    pub schedule: Schedule,

    #[serde(default)]
    pub actions: Vec<Action>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Element the actions run against; the trigger id is used when absent
    #[serde(default)]
    pub element_id: Option<String>,

    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,

    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl TimeTrigger {
    pub fn new(id: &str, schedule: Schedule) -> Self {
        Self {
            id: id.to_string(),
            schedule,
            actions: Vec::new(),
            enabled: true,
            element_id: None,
            last_execution: None,
            next_execution: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn for_element(mut self, element_id: &str) -> Self {
        self.element_id = Some(element_id.to_string());
        self
    }

    /// Element id used as the action scope
    pub fn scope_element(&self) -> &str {
        self.element_id.as_deref().unwrap_or(&self.id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_execution.map_or(false, |next| next <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_trigger_from_json() {
        let trigger: TimeTrigger = serde_json::from_value(json!({
            "id": "t1",
            "schedule_type": "cyclic",
            "schedule_data": {"interval_seconds": 60},
            "actions": [{"type": "log", "message": "tick"}]
        }))
        .unwrap();

        assert_eq!(trigger.schedule, Schedule::cyclic(60));
        assert!(trigger.enabled);
        assert_eq!(trigger.scope_element(), "t1");
    }

    #[test]
    fn test_scheduled_rolls_to_next_day() {
        let now = at("2024-03-10T10:30:00Z");
        let schedule = Schedule::daily_at(9, 0);
        assert_eq!(schedule.first_execution(now), Some(at("2024-03-11T09:00:00Z")));

        let schedule = Schedule::daily_at(11, 15);
        assert_eq!(schedule.first_execution(now), Some(at("2024-03-10T11:15:00Z")));
    }

    #[test]
    fn test_sequential_goes_idle_after_last_instant() {
        let now = at("2024-03-10T10:00:00Z");
        let mut schedule = Schedule::Sequential {
            times: vec![at("2024-03-10T11:00:00Z"), at("2024-03-10T12:00:00Z")],
            next_index: 0,
        };

        assert_eq!(schedule.first_execution(now), Some(at("2024-03-10T11:00:00Z")));
        assert_eq!(schedule.advance(at("2024-03-10T11:00:00Z")), Some(at("2024-03-10T12:00:00Z")));
        assert_eq!(schedule.advance(at("2024-03-10T12:00:00Z")), None);
    }

    #[test]
    fn test_delayed_fires_once() {
        let now = at("2024-03-10T10:00:00Z");
        let mut schedule = Schedule::Delayed { delay_seconds: 90 };
        assert_eq!(schedule.first_execution(now), Some(at("2024-03-10T10:01:30Z")));
        assert_eq!(schedule.advance(now), None);
    }

    #[test]
    fn test_past_instants_are_clamped() {
        let now = at("2024-03-10T10:00:00Z");
        let schedule = Schedule::Scheduled {
            hour: None,
            minute: None,
            at: Some(at("2024-01-01T00:00:00Z")),
        };
        assert_eq!(schedule.first_execution(now), Some(now));
    }

    #[test]
    fn test_validation() {
        assert!(Schedule::cyclic(0).validate().is_err());
        assert!(Schedule::daily_at(24, 0).validate().is_err());
        assert!(Schedule::Scheduled { hour: None, minute: None, at: None }.validate().is_err());
        assert!(Schedule::daily_at(23, 59).validate().is_ok());
    }

    #[test]
    fn test_oversized_periods_rejected() {
        assert!(Schedule::cyclic(10_000_000_000_000).validate().is_err());
        assert!(Schedule::Delayed { delay_seconds: u64::MAX }.validate().is_err());
        assert!(Schedule::Duration { duration_seconds: Some(MAX_PERIOD_SECONDS + 1) }
            .validate()
            .is_err());
        assert!(Schedule::cyclic(MAX_PERIOD_SECONDS).validate().is_ok());
    }

    #[test]
    fn test_unrepresentable_instants_go_idle() {
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let mut schedule = Schedule::cyclic(MAX_PERIOD_SECONDS);
        assert_eq!(schedule.first_execution(near_end), None);
        assert_eq!(schedule.advance(near_end), None);
        assert_eq!(Schedule::cyclic(u64::MAX).first_execution(Utc::now()), None);
    }
}
