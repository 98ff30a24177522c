//! Geographic time zone resolution.

pub mod resolver;
pub mod types;

pub use resolver::{GoogleMapsResolver, TimeZoneResolver};
pub use types::{GeoCoordinate, ResolvedTimeZone, TimeZoneId};
