//! Time-of-day bandwidth schedule.
//!
//! Rules are checked in file order; the first whose day set and time window
//! contain the current local time supplies the limit, otherwise the default
//! applies. A window whose end is before its start wraps past midnight.
//!
//! ```json
//! {
//!   "rules": [
//!     { "name": "Business", "days": ["mon", "tue", "wed", "thu", "fri"],
//!       "start_time": "09:00", "end_time": "18:00", "limit_bytes_per_sec": "100M" }
//!   ],
//!   "default_limit": "200M",
//!   "enabled": true
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Local, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::throttle::{parse_rate, RateLimit, TokenBucket};

/// Minimum interval between schedule re-resolutions, in milliseconds.
const RESOLVE_INTERVAL_MS: u64 = 1000;

/// One schedule rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRule {
    /// Label for logs.
    pub name: String,
    /// Days the rule applies; `None` means every day.
    pub days: Option<Vec<Weekday>>,
    /// Window start (inclusive).
    pub start: NaiveTime,
    /// Window end (exclusive). Equal to `start` means the whole day.
    pub end: NaiveTime,
    /// Bytes per second while active; 0 is unlimited.
    pub limit: u64,
}

impl ScheduleRule {
    /// Whether the rule covers `day` at `time`.
    #[must_use]
    pub fn matches(&self, day: Weekday, time: NaiveTime) -> bool {
        if let Some(days) = &self.days {
            if !days.contains(&day) {
                return false;
            }
        }
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Ordered rule list with a default limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "RawSchedule")]
pub struct Schedule {
    /// Rules in priority order.
    pub rules: Vec<ScheduleRule>,
    /// Limit when no rule matches; 0 is unlimited.
    pub default_limit: u64,
    /// When false, no rule or default applies and transfers are unlimited.
    pub enabled: bool,
}

impl Schedule {
    /// Schedule that always resolves to `limit`.
    #[must_use]
    pub const fn fixed(limit: u64) -> Self {
        Self {
            rules: Vec::new(),
            default_limit: limit,
            enabled: true,
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ScheduleConfig`] if the file is unreadable or
    /// malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::ScheduleConfig(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parse from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ScheduleConfig`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::ScheduleConfig(e.to_string()))
    }

    /// The rule in force at `day`/`time`, if any.
    #[must_use]
    pub fn active_rule(&self, day: Weekday, time: NaiveTime) -> Option<&ScheduleRule> {
        if !self.enabled {
            return None;
        }
        self.rules.iter().find(|rule| rule.matches(day, time))
    }

    /// Limit in force at `day`/`time`; 0 (unlimited) when disabled.
    #[must_use]
    pub fn resolve(&self, day: Weekday, time: NaiveTime) -> u64 {
        if !self.enabled {
            return 0;
        }
        self.active_rule(day, time).map_or(self.default_limit, |rule| rule.limit)
    }

    /// Limit in force now, in local time.
    #[must_use]
    pub fn resolve_now(&self) -> u64 {
        let now = Local::now();
        self.resolve(now.weekday(), now.time())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Bytes(u64),
    Text(String),
}

#[derive(Serialize, Deserialize)]
struct RawRule {
    name: String,
    #[serde(default)]
    days: Vec<String>,
    start_time: String,
    end_time: String,
    limit_bytes_per_sec: RawLimit,
}

#[derive(Serialize, Deserialize)]
struct RawSchedule {
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default = "unlimited")]
    default_limit: RawLimit,
    #[serde(default = "enabled")]
    enabled: bool,
}

const fn unlimited() -> RawLimit {
    RawLimit::Bytes(0)
}

const fn enabled() -> bool {
    true
}

fn parse_limit(raw: RawLimit) -> Result<u64> {
    match raw {
        RawLimit::Bytes(n) => Ok(n),
        RawLimit::Text(s) => parse_rate(&s).map_err(|_| SyncError::ScheduleConfig(format!("invalid limit '{s}'"))),
    }
}

fn weekday(name: &str) -> Option<Weekday> {
    Some(match name {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => return None,
    })
}

/// Parse one `days` entry: a day name, an inclusive range such as
/// `mon-fri` (which may wrap, as in `fri-mon`), or `all`/`*`.
/// `None` means every day.
fn parse_day(entry: &str) -> Result<Option<Vec<Weekday>>> {
    let token = entry.trim().to_ascii_lowercase();
    if token == "all" || token == "*" {
        return Ok(None);
    }
    let unknown = || SyncError::ScheduleConfig(format!("unknown day '{entry}'"));
    let Some((from, to)) = token.split_once(['-', '\u{2013}']) else {
        return weekday(&token).map(|d| Some(vec![d])).ok_or_else(unknown);
    };
    let from = weekday(from.trim()).ok_or_else(unknown)?;
    let to = weekday(to.trim()).ok_or_else(unknown)?;
    let mut days = vec![from];
    let mut day = from;
    while day != to {
        day = day.succ();
        days.push(day);
    }
    Ok(Some(days))
}

fn parse_time(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|_| SyncError::ScheduleConfig(format!("invalid time '{text}', expected HH:MM")))
}

impl TryFrom<RawSchedule> for Schedule {
    type Error = SyncError;

    fn try_from(raw: RawSchedule) -> Result<Self> {
        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in raw.rules {
            let mut days = Some(Vec::new());
            for entry in &rule.days {
                match parse_day(entry)? {
                    Some(parsed) => {
                        if let Some(list) = days.as_mut() {
                            for d in parsed {
                                if !list.contains(&d) {
                                    list.push(d);
                                }
                            }
                        }
                    }
                    None => days = None,
                }
            }
            if rule.days.is_empty() {
                days = None;
            }
            rules.push(ScheduleRule {
                name: rule.name,
                days,
                start: parse_time(&rule.start_time)?,
                end: parse_time(&rule.end_time)?,
                limit: parse_limit(rule.limit_bytes_per_sec)?,
            });
        }
        Ok(Self {
            rules,
            default_limit: parse_limit(raw.default_limit)?,
            enabled: raw.enabled,
        })
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl From<Schedule> for RawSchedule {
    fn from(schedule: Schedule) -> Self {
        Self {
            rules: schedule
                .rules
                .into_iter()
                .map(|rule| RawRule {
                    name: rule.name,
                    days: rule.days.map_or_else(
                        || vec!["all".to_string()],
                        |days| days.into_iter().map(|d| day_name(d).to_string()).collect(),
                    ),
                    start_time: format!("{:02}:{:02}", rule.start.hour(), rule.start.minute()),
                    end_time: format!("{:02}:{:02}", rule.end.hour(), rule.end.minute()),
                    limit_bytes_per_sec: RawLimit::Bytes(rule.limit),
                })
                .collect(),
            default_limit: RawLimit::Bytes(schedule.default_limit),
            enabled: schedule.enabled,
        }
    }
}

/// Token bucket whose rate follows a [`Schedule`].
///
/// The rate is re-resolved at most once per second, by whichever caller
/// first notices the interval has passed.
#[derive(Debug)]
pub struct ScheduledThrottle {
    bucket: Arc<TokenBucket>,
    schedule: Schedule,
    /// Milliseconds since `epoch` of the last resolution, plus one; 0 = never.
    last_resolved: AtomicU64,
    epoch: Instant,
}

impl ScheduledThrottle {
    /// Drive `bucket` from `schedule`, resolving the current rate now.
    #[must_use]
    pub fn new(schedule: Schedule, bucket: Arc<TokenBucket>) -> Self {
        let throttle = Self {
            bucket,
            schedule,
            last_resolved: AtomicU64::new(0),
            epoch: Instant::now(),
        };
        throttle.refresh();
        throttle
    }

    /// Underlying bucket.
    #[must_use]
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    /// Schedule in use.
    #[must_use]
    pub const fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Re-resolve if the interval has passed. Returns whether this call did.
    #[allow(clippy::cast_possible_truncation)]
    pub fn refresh(&self) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64 + 1;
        let last = self.last_resolved.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < RESOLVE_INTERVAL_MS {
            return false;
        }
        if self
            .last_resolved
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let local = Local::now();
        self.apply(local.weekday(), local.time());
        true
    }

    /// Set the bucket rate for an explicit day and time.
    pub fn apply(&self, day: Weekday, time: NaiveTime) {
        let limit = self.schedule.resolve(day, time);
        if limit != self.bucket.rate() {
            match self.schedule.active_rule(day, time) {
                Some(rule) => info!(rule = %rule.name, limit, "bandwidth schedule rule active"),
                None if self.schedule.enabled => info!(limit, "bandwidth schedule default active"),
                None => info!("bandwidth schedule disabled, unlimited"),
            }
            self.bucket.set_rate(limit);
        } else {
            debug!(limit, "bandwidth schedule unchanged");
        }
    }
}

impl RateLimit for ScheduledThrottle {
    fn acquire(&self, bytes: u64) {
        self.refresh();
        self.bucket.acquire(bytes);
    }
}
