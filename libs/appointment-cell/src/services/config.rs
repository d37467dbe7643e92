// libs/appointment-cell/src/services/config.rs
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveTime, Weekday};
use tracing::{debug, warn};

use crate::models::{BusinessWindow, SchedulingConfig};
use crate::store::{ConfigStore, StoreError};

pub const SLOT_DURATION_MINUTES: &str = "SLOT_DURATION_MINUTES";
pub const MAX_ACTIVE_APPOINTMENTS_PER_CLIENT: &str = "MAX_ACTIVE_APPOINTMENTS_PER_CLIENT";
pub const MIN_LEAD_HOURS: &str = "MIN_LEAD_HOURS";
pub const MIN_CANCEL_NOTICE_HOURS: &str = "MIN_CANCEL_NOTICE_HOURS";
pub const MORNING_START: &str = "MORNING_START";
pub const MORNING_END: &str = "MORNING_END";
pub const MORNING_LAST_START: &str = "MORNING_LAST_START";
pub const AFTERNOON_START: &str = "AFTERNOON_START";
pub const AFTERNOON_END: &str = "AFTERNOON_END";
pub const AFTERNOON_LAST_START: &str = "AFTERNOON_LAST_START";
pub const WORKING_DAYS: &str = "WORKING_DAYS";
pub const SUNDAY_CLOSED: &str = "SUNDAY_CLOSED";
pub const CANCELLATION_NOTE_ENABLED: &str = "CANCELLATION_NOTE_ENABLED";
pub const MAX_ADVANCE_DAYS: &str = "MAX_ADVANCE_DAYS";

pub const CONFIG_KEYS: [&str; 14] = [
    SLOT_DURATION_MINUTES,
    MAX_ACTIVE_APPOINTMENTS_PER_CLIENT,
    MIN_LEAD_HOURS,
    MIN_CANCEL_NOTICE_HOURS,
    MORNING_START,
    MORNING_END,
    MORNING_LAST_START,
    AFTERNOON_START,
    AFTERNOON_END,
    AFTERNOON_LAST_START,
    WORKING_DAYS,
    SUNDAY_CLOSED,
    CANCELLATION_NOTE_ENABLED,
    MAX_ADVANCE_DAYS,
];

const DEFAULT_SLOT_MINUTES: u32 = 60;

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            slot_duration_minutes: DEFAULT_SLOT_MINUTES,
            max_active_per_client: 3,
            min_lead_hours: 2,
            min_cancel_notice_hours: 1,
            morning: BusinessWindow { open: hm(10, 0), close: hm(13, 0), last_start: hm(12, 0) },
            afternoon: BusinessWindow { open: hm(17, 0), close: hm(21, 0), last_start: hm(20, 0) },
            working_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
            ],
            cancellation_note_enabled: false,
            max_advance_days: None,
        }
    }
}

/// Resolves the scheduling configuration from the key-value store, once per operation.
pub struct ConfigProvider {
    store: Arc<dyn ConfigStore>,
}

impl ConfigProvider {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<SchedulingConfig, StoreError> {
        let values = self.store.get_values(&CONFIG_KEYS).await?;
        debug!("Loaded {} scheduling settings", values.len());
        Ok(resolve(&values))
    }
}

/// Build a config from raw values. Missing or unparsable keys fall back to
/// their defaults; this never fails.
pub fn resolve(values: &HashMap<String, String>) -> SchedulingConfig {
    let defaults = SchedulingConfig::default();

    let slot_duration_minutes = parse_or(values, SLOT_DURATION_MINUTES, defaults.slot_duration_minutes, |raw| {
        raw.parse::<u32>().ok().filter(|m| *m > 0)
    });
    let slot = Duration::minutes(slot_duration_minutes as i64);

    let morning = resolve_window(values, MORNING_START, MORNING_END, MORNING_LAST_START, defaults.morning, slot);
    let afternoon = resolve_window(values, AFTERNOON_START, AFTERNOON_END, AFTERNOON_LAST_START, defaults.afternoon, slot);

    SchedulingConfig {
        slot_duration_minutes,
        max_active_per_client: parse_or(values, MAX_ACTIVE_APPOINTMENTS_PER_CLIENT, defaults.max_active_per_client, |raw| raw.parse().ok()),
        min_lead_hours: parse_or(values, MIN_LEAD_HOURS, defaults.min_lead_hours, |raw| raw.parse().ok()),
        min_cancel_notice_hours: parse_or(values, MIN_CANCEL_NOTICE_HOURS, defaults.min_cancel_notice_hours, |raw| raw.parse().ok()),
        morning,
        afternoon,
        working_days: resolve_working_days(values, defaults.working_days),
        cancellation_note_enabled: parse_or(values, CANCELLATION_NOTE_ENABLED, defaults.cancellation_note_enabled, parse_bool),
        max_advance_days: values
            .get(MAX_ADVANCE_DAYS)
            .and_then(|raw| parse_logged(MAX_ADVANCE_DAYS, raw, |r| r.parse::<u32>().ok().filter(|d| *d > 0))),
    }
}

fn parse_or<T>(
    values: &HashMap<String, String>,
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> T {
    match values.get(key) {
        Some(raw) => parse_logged(key, raw, parse).unwrap_or(default),
        None => default,
    }
}

fn parse_logged<T>(key: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!("Setting {} has an invalid value ({}), using default", key, raw);
    }
    parsed
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "si" | "sí" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn resolve_window(
    values: &HashMap<String, String>,
    open_key: &str,
    close_key: &str,
    last_start_key: &str,
    default: BusinessWindow,
    slot: Duration,
) -> BusinessWindow {
    let open = parse_or(values, open_key, default.open, parse_time);
    let close = parse_or(values, close_key, default.close, parse_time);

    if open >= close {
        warn!("Window {}..{} is empty, using default", open, close);
        return default;
    }

    let derived = close - slot;
    let last_start = match values.get(last_start_key).and_then(|raw| parse_logged(last_start_key, raw, parse_time)) {
        Some(explicit) => explicit,
        None if derived >= open && derived <= close => derived,
        // The slot is longer than the window; nothing can start in it.
        None => NaiveTime::MIN,
    };

    BusinessWindow { open, close, last_start }
}

/// An explicit day-code list wins over the Sunday flag.
fn resolve_working_days(values: &HashMap<String, String>, default: Vec<Weekday>) -> Vec<Weekday> {
    if let Some(days) = values
        .get(WORKING_DAYS)
        .and_then(|raw| parse_logged(WORKING_DAYS, raw, parse_day_codes))
    {
        return days;
    }

    match values.get(SUNDAY_CLOSED).and_then(|raw| parse_logged(SUNDAY_CLOSED, raw, parse_bool)) {
        Some(false) => {
            let mut all = default;
            all.push(Weekday::Sun);
            all
        }
        _ => default,
    }
}

/// "L,M,X,J,V,S,D" for Monday..Sunday.
fn parse_day_codes(raw: &str) -> Option<Vec<Weekday>> {
    let mut days = Vec::new();
    for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let day = match code.to_ascii_uppercase().as_str() {
            "L" => Weekday::Mon,
            "M" => Weekday::Tue,
            "X" => Weekday::Wed,
            "J" => Weekday::Thu,
            "V" => Weekday::Fri,
            "S" => Weekday::Sat,
            "D" => Weekday::Sun,
            _ => return None,
        };
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Some(days)
}
