//! Person records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{GeoCoordinate, TimeZoneId};

/// A registered person.
///
/// `last_notified_at` only moves forward, and only after a confirmed send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub time_zone: TimeZoneId,
    pub city: String,
    pub country: String,
    /// Coordinate the zone was resolved from, kept for auditing.
    pub location: Option<GeoCoordinate>,
    pub created_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl Person {
    /// `"{first} {last}"`.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Free-text place description handed to the resolver.
    pub fn place_description(&self) -> String {
        place_description(&self.city, &self.country)
    }
}

/// Attributes of a person about to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerson {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub time_zone: TimeZoneId,
    pub city: String,
    pub country: String,
    pub location: Option<GeoCoordinate>,
}

impl NewPerson {
    /// Materializes the record once the store has assigned an id.
    pub fn into_person(self, id: i64, created_at: DateTime<Utc>) -> Person {
        Person {
            id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            date_of_birth: self.date_of_birth,
            time_zone: self.time_zone,
            city: self.city,
            country: self.country,
            location: self.location,
            created_at,
            last_notified_at: None,
        }
    }
}

pub(crate) fn place_description(city: &str, country: &str) -> String {
    format!("{}, {}", city.trim(), country.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_person() -> NewPerson {
        NewPerson {
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 6, 15).unwrap(),
            time_zone: TimeZoneId::parse("America/Los_Angeles").unwrap(),
            city: " Los Angeles".to_string(),
            country: "USA ".to_string(),
            location: Some(GeoCoordinate::new(34.05, -118.24)),
        }
    }

    #[test]
    fn test_into_person() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let person = new_person().into_person(7, created_at);

        assert_eq!(person.id, 7);
        assert_eq!(person.created_at, created_at);
        assert!(person.last_notified_at.is_none());
        assert_eq!(person.full_name(), "Ada Lovelace");
    }

    #[test]
    fn test_place_description_trims() {
        let person = new_person().into_person(1, Utc::now());
        assert_eq!(person.place_description(), "Los Angeles, USA");
    }
}
