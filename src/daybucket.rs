//! # Day Bucketing — Calendar Days in a Channel's Timezone
//!
//! Per-day statistics are bucketed by the channel's local calendar day, not
//! by UTC day. Conversions go through the IANA database (`chrono-tz`), so days
//! around daylight-saving transitions are 23 or 25 hours long as they should
//! be.
//!
//! | Transition | Local midnight | Resolution |
//! |------------|----------------|------------|
//! | Gap (clocks skip midnight) | does not exist | first valid local instant after it |
//! | Overlap (midnight occurs twice) | ambiguous | earlier of the two |
//!
//! Stored zone names are validated on write. A name that still fails to
//! resolve at read time falls back to UTC with a warning.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use tracing::warn;

/// Parse an IANA zone name, rejecting unknown names.
pub fn validate_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| anyhow!("unknown timezone '{}'", name))
}

/// Parse an IANA zone name, falling back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, "unknown timezone, bucketing by UTC day");
            Tz::UTC
        }
    }
}

/// The calendar day `instant` falls on in `tz`.
pub fn local_day(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// The UTC instant at which `day` starts in `tz`.
pub fn day_start_utc(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = NaiveDateTime::from(day);
    // Gaps are at most a few hours; scan forward a minute at a time.
    for minutes in 0..=(24 * 60) {
        let local = midnight + Duration::minutes(minutes);
        if let Some(start) = tz.from_local_datetime(&local).earliest() {
            return start.with_timezone(&Utc);
        }
    }
    // Unreachable for real zones; treat the day as UTC.
    Utc.from_utc_datetime(&midnight)
}

/// Half-open UTC range `[start, end)` covering `day` in `tz`.
pub fn day_range_utc(day: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let next = day.succ_opt().unwrap_or(day);
    (day_start_utc(day, tz), day_start_utc(next, tz))
}

/// Keep the latest item of each local calendar day.
pub fn last_per_day<T, F>(items: impl IntoIterator<Item = T>, tz: Tz, timestamp: F) -> BTreeMap<NaiveDate, T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let mut days: BTreeMap<NaiveDate, T> = BTreeMap::new();
    for item in items {
        let at = timestamp(&item);
        let day = local_day(at, tz);
        match days.get(&day) {
            Some(existing) if timestamp(existing) > at => {}
            _ => {
                days.insert(day, item);
            }
        }
    }
    days
}
