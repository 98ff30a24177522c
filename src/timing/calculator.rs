//! Delivery instant calculation.
//!
//! Pure functions of their inputs: no clock reads, no I/O. Callers pass the
//! reference instant explicitly.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CalculatorError;
use crate::geo::TimeZoneId;

/// Local wall-clock hour at which birthday messages go out.
pub const DEFAULT_DELIVERY_HOUR: u32 = 9;

/// Granularity used to step out of a DST gap.
const GAP_STEP_MINUTES: i64 = 15;

/// Longest DST gap we try to step across.
const MAX_GAP_STEPS: i64 = 16;

/// A computed delivery: the absolute instant plus the local calendar date it
/// represents in the person's zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTime {
    pub instant: DateTime<Utc>,
    pub local_date: NaiveDate,
}

/// Returns the nearest birthday delivery strictly after `reference_now`.
///
/// The birthday's month/day is placed in the current local year of `zone`
/// (as seen at `reference_now`); if that moment is not strictly in the future
/// the following year is used. February 29 falls back to February 28 in
/// non-leap years.
///
/// # Errors
///
/// Returns `CalculatorError::InvalidDeliveryHour` for an hour outside 0..=23.
pub fn next_delivery_instant(
    date_of_birth: NaiveDate,
    zone: &TimeZoneId,
    reference_now: DateTime<Utc>,
    delivery_hour: u32,
) -> Result<DeliveryTime, CalculatorError> {
    let local_year = reference_now.with_timezone(&zone.tz()).year();

    let this_year = delivery_instant_in_year(date_of_birth, zone, local_year, delivery_hour)?;
    if this_year.instant > reference_now {
        return Ok(this_year);
    }

    delivery_instant_in_year(date_of_birth, zone, local_year + 1, delivery_hour)
}

/// Returns the delivery for the birthday falling in an explicit `year`.
///
/// # Errors
///
/// Returns `CalculatorError::InvalidDeliveryHour` for an hour outside 0..=23,
/// or `CalculatorError::NonexistentLocalTime` when no valid local time can be
/// found for that date.
pub fn delivery_instant_in_year(
    date_of_birth: NaiveDate,
    zone: &TimeZoneId,
    year: i32,
    delivery_hour: u32,
) -> Result<DeliveryTime, CalculatorError> {
    let time = NaiveTime::from_hms_opt(delivery_hour, 0, 0)
        .ok_or(CalculatorError::InvalidDeliveryHour(delivery_hour))?;

    let local_date = birthday_in_year(date_of_birth, year).ok_or_else(|| {
        CalculatorError::NonexistentLocalTime {
            date: date_of_birth,
            hour: delivery_hour,
            zone: zone.to_string(),
        }
    })?;

    let instant = resolve_local(zone, local_date.and_time(time)).ok_or_else(|| {
        CalculatorError::NonexistentLocalTime {
            date: local_date,
            hour: delivery_hour,
            zone: zone.to_string(),
        }
    })?;

    Ok(DeliveryTime {
        instant,
        local_date,
    })
}

fn birthday_in_year(date_of_birth: NaiveDate, year: i32) -> Option<NaiveDate> {
    let (month, day) = (date_of_birth.month(), date_of_birth.day());
    NaiveDate::from_ymd_opt(year, month, day).or_else(|| {
        // Feb 29 in a non-leap year
        if month == 2 && day == 29 {
            NaiveDate::from_ymd_opt(year, 2, 28)
        } else {
            None
        }
    })
}

/// Maps a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times inside a
/// DST gap move forward to the first valid local time.
fn resolve_local(zone: &TimeZoneId, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let tz = zone.tz();
    (0..=MAX_GAP_STEPS).find_map(|step| {
        let candidate = local + Duration::minutes(step * GAP_STEP_MINUTES);
        tz.from_local_datetime(&candidate)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}
