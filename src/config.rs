use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::{LoadKind, Ms, HOUR_MS, MINUTE_MS};

/// Opening hours of one day. `close` is the pool-0 closing boundary; staggered pools
/// close later by their offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl OperatingWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    /// Build from `(hour, minute)` pairs. Panics on out-of-range values; meant for constants and tests.
    pub fn hm(open: (u32, u32), close: (u32, u32)) -> Self {
        Self {
            open: NaiveTime::from_hms_opt(open.0, open.1, 0).expect("valid opening time"),
            close: NaiveTime::from_hms_opt(close.0, close.1, 0).expect("valid closing time"),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.close > self.open
    }
}

/// Operating hours per weekday; `None` means closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: [Option<OperatingWindow>; 7],
}

impl WeeklyHours {
    pub fn every_day(window: OperatingWindow) -> Self {
        Self { days: [Some(window); 7] }
    }

    pub fn closed() -> Self {
        Self { days: [None; 7] }
    }

    pub fn with_day(mut self, day: Weekday, window: Option<OperatingWindow>) -> Self {
        self.days[day.num_days_from_monday() as usize] = window;
        self
    }

    pub fn for_day(&self, day: Weekday) -> Option<OperatingWindow> {
        self.days[day.num_days_from_monday() as usize]
    }

    /// Parse a JSON table such as `{"mon": ["08:00", "20:00"], "sun": null}`.
    /// Weekdays missing from the table are closed.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let table: BTreeMap<String, Option<(String, String)>> =
            serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let mut hours = Self::closed();
        for (day, window) in table {
            let weekday = Weekday::from_str(&day).map_err(|_| format!("unknown weekday: {day}"))?;
            let window = match window {
                Some((open, close)) => Some(OperatingWindow::new(
                    parse_hm(&open)?,
                    parse_hm(&close)?,
                )),
                None => None,
            };
            hours = hours.with_day(weekday, window);
        }
        Ok(hours)
    }
}

fn parse_hm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| format!("bad time {raw:?}: {e}"))
}

/// Units consumed per load kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadUnits {
    pub combined: u32,
    pub separated: u32,
}

impl LoadUnits {
    pub fn units_for(&self, kind: LoadKind) -> u32 {
        if kind.is_separated() {
            self.separated
        } else {
            self.combined
        }
    }
}

impl Default for LoadUnits {
    fn default() -> Self {
        Self { combined: 1, separated: 2 }
    }
}

/// Booking policy. Consumed by the engine, owned by whoever configures the facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Minimum notice between `now` and a slot's start for a booking to be accepted.
    pub lead_time: Ms,
    /// Minimum idle gap between two allocations of the same requester on one date.
    pub buffer: Ms,
    pub waitlist_cap: u32,
    /// Granted allocations not claimed by `start - checkin_deadline` become no-shows.
    pub checkin_deadline: Ms,
    /// Requesters cannot cancel a granted allocation closer than this to its start.
    pub cancel_cutoff: Option<Ms>,
    pub load_units: LoadUnits,
    pub slot_minutes: u32,
    pub stagger_minutes: u32,
    pub hours: WeeklyHours,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            lead_time: 2 * HOUR_MS,
            buffer: 10 * MINUTE_MS,
            waitlist_cap: 10,
            checkin_deadline: 5 * MINUTE_MS,
            cancel_cutoff: Some(HOUR_MS),
            load_units: LoadUnits::default(),
            slot_minutes: 60,
            stagger_minutes: 10,
            hours: WeeklyHours::every_day(OperatingWindow::hm((8, 0), (20, 0))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Daemon settings, read from `SLOTLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// How many days ahead (including today) the top-up task keeps generated.
    pub topup_days: u32,
    /// Pools bootstrapped on first start.
    pub pools: u32,
    pub units_per_pool: u32,
    pub policy: Policy,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Policy::default();
        let minutes = |key: &'static str, default: Ms| -> Result<Ms, ConfigError> {
            Ok(parse_or(&lookup, key, default / MINUTE_MS)? * MINUTE_MS)
        };

        let cancel_cutoff = match lookup("SLOTLINE_CANCEL_CUTOFF_MINS").as_deref() {
            Some("off") | Some("none") => None,
            _ => Some(minutes("SLOTLINE_CANCEL_CUTOFF_MINS", defaults.cancel_cutoff.unwrap_or(0))?),
        };
        let hours = match lookup("SLOTLINE_HOURS") {
            Some(raw) => WeeklyHours::from_json(&raw).map_err(|reason| ConfigError {
                key: "SLOTLINE_HOURS",
                reason,
            })?,
            None => defaults.hours.clone(),
        };

        let policy = Policy {
            lead_time: minutes("SLOTLINE_LEAD_TIME_MINS", defaults.lead_time)?,
            buffer: minutes("SLOTLINE_BUFFER_MINS", defaults.buffer)?,
            waitlist_cap: parse_or(&lookup, "SLOTLINE_WAITLIST_CAP", defaults.waitlist_cap)?,
            checkin_deadline: minutes("SLOTLINE_CHECKIN_DEADLINE_MINS", defaults.checkin_deadline)?,
            cancel_cutoff,
            load_units: LoadUnits {
                combined: parse_or(&lookup, "SLOTLINE_COMBINED_UNITS", defaults.load_units.combined)?,
                separated: parse_or(&lookup, "SLOTLINE_SEPARATED_UNITS", defaults.load_units.separated)?,
            },
            slot_minutes: parse_or(&lookup, "SLOTLINE_SLOT_MINS", defaults.slot_minutes)?,
            stagger_minutes: parse_or(&lookup, "SLOTLINE_STAGGER_MINS", defaults.stagger_minutes)?,
            hours,
        };
        let positive = [
            ("SLOTLINE_SLOT_MINS", policy.slot_minutes > 0),
            ("SLOTLINE_LEAD_TIME_MINS", policy.lead_time > 0),
            ("SLOTLINE_BUFFER_MINS", policy.buffer > 0),
            ("SLOTLINE_COMBINED_UNITS", policy.load_units.combined > 0),
            ("SLOTLINE_SEPARATED_UNITS", policy.load_units.separated > 0),
        ];
        if let Some((key, _)) = positive.into_iter().find(|(_, ok)| !ok) {
            return Err(ConfigError {
                key,
                reason: "must be positive".into(),
            });
        }
        let non_negative = [
            ("SLOTLINE_CHECKIN_DEADLINE_MINS", policy.checkin_deadline >= 0),
            ("SLOTLINE_CANCEL_CUTOFF_MINS", policy.cancel_cutoff.is_none_or(|c| c >= 0)),
        ];
        if let Some((key, _)) = non_negative.into_iter().find(|(_, ok)| !ok) {
            return Err(ConfigError {
                key,
                reason: "must not be negative".into(),
            });
        }

        Ok(Self {
            data_dir: PathBuf::from(lookup("SLOTLINE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: match lookup("SLOTLINE_METRICS_PORT") {
                Some(raw) => Some(parse_value("SLOTLINE_METRICS_PORT", &raw)?),
                None => None,
            },
            compact_threshold: parse_or(&lookup, "SLOTLINE_COMPACT_THRESHOLD", 1000)?,
            sweep_interval: Duration::from_secs(parse_or(&lookup, "SLOTLINE_SWEEP_INTERVAL_SECS", 60)?),
            topup_days: parse_or(&lookup, "SLOTLINE_TOPUP_DAYS", 7)?,
            pools: parse_or(&lookup, "SLOTLINE_POOLS", 5)?,
            units_per_pool: parse_or(&lookup, "SLOTLINE_UNITS_PER_POOL", 2)?,
            policy,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}
