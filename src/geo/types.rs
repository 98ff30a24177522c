//! Value types produced by the resolver.

use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::CalculatorError;

/// A point on the globe as returned by the geocoding upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// `lat,lng` form used by the time zone upstream.
    pub fn to_query_value(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

/// A validated IANA time zone identifier (e.g. `America/Los_Angeles`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeZoneId(Tz);

impl TimeZoneId {
    /// Parses an IANA identifier.
    ///
    /// # Errors
    ///
    /// Returns `CalculatorError::UnknownTimeZone` when the identifier is not in
    /// the bundled tz database.
    pub fn parse(id: &str) -> Result<Self, CalculatorError> {
        Tz::from_str(id.trim())
            .map(Self)
            .map_err(|_| CalculatorError::UnknownTimeZone(id.to_string()))
    }

    pub fn tz(&self) -> Tz {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        self.0.name()
    }
}

impl From<Tz> for TimeZoneId {
    fn from(tz: Tz) -> Self {
        Self(tz)
    }
}

impl fmt::Display for TimeZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful resolution: the zone plus the coordinate it came
/// from, kept for auditing on the person record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTimeZone {
    pub zone: TimeZoneId,
    pub coordinate: GeoCoordinate,
}
