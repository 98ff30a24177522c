//! Place description to time zone resolution.
//!
//! Resolution is a two-step protocol against the maps upstream:
//!
//! 1. `GET {base}/geocode/json?address=...` turns free text into a coordinate
//! 2. `GET {base}/timezone/json?location=lat,lng&timestamp=...` maps the
//!    coordinate to an IANA zone id valid at the given instant
//!
//! Failures are classified into [`ResolutionError`] and returned as-is; the
//! resolver never retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::ResolutionError;
use crate::metrics::MetricsCollector;

use super::types::{GeoCoordinate, ResolvedTimeZone, TimeZoneId};

/// Resolves a free-text place description into a time zone.
#[async_trait]
pub trait TimeZoneResolver: Send + Sync {
    /// Resolves `place` to a zone valid at `at`.
    async fn resolve_time_zone(
        &self,
        place: &str,
        at: DateTime<Utc>,
    ) -> Result<ResolvedTimeZone, ResolutionError>;
}

/// Resolver backed by the Google Maps geocoding and time zone APIs.
pub struct GoogleMapsResolver {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl GoogleMapsResolver {
    /// Creates a resolver from explicit configuration.
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Result<&str, ResolutionError> {
        self.api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(ResolutionError::MissingCredentials)
    }

    /// Geocodes a place description to its first matching coordinate.
    pub async fn geocode(&self, place: &str) -> Result<GeoCoordinate, ResolutionError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/geocode/json?address={}&key={}",
            self.base_url,
            urlencoding::encode(place),
            urlencoding::encode(api_key)
        );

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.upstream_error("geocode", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.upstream_error("geocode", format!("HTTP {}", status.as_u16())));
        }

        let body: GeocodeResponse = response
            .json()
            .await
            .map_err(|e| self.upstream_error("geocode", format!("invalid response: {}", e)))?;

        match body.status.as_str() {
            "OK" | "ZERO_RESULTS" => {}
            other => {
                return Err(self.upstream_error("geocode", format!("status {}", other)));
            }
        }

        let Some(first) = body.results.into_iter().next() else {
            self.metrics.record_resolver_request("geocode", "not_found");
            debug!(place = place, "Geocoding returned no results");
            return Err(ResolutionError::NoLocationFound(place.to_string()));
        };

        self.metrics.record_resolver_request("geocode", "ok");
        Ok(GeoCoordinate::new(
            first.geometry.location.lat,
            first.geometry.location.lng,
        ))
    }

    /// Looks up the zone covering `coordinate` at instant `at`.
    pub async fn lookup_time_zone(
        &self,
        coordinate: GeoCoordinate,
        at: DateTime<Utc>,
    ) -> Result<TimeZoneId, ResolutionError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/timezone/json?location={}&timestamp={}&key={}",
            self.base_url,
            coordinate.to_query_value(),
            at.timestamp(),
            urlencoding::encode(api_key)
        );

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.upstream_error("timezone", e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(self.upstream_error("timezone", format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(self.no_time_zone(coordinate, format!("HTTP {}", status.as_u16())));
        }

        let body: TimeZoneResponse = response
            .json()
            .await
            .map_err(|e| self.upstream_error("timezone", format!("invalid response: {}", e)))?;

        if body.status != "OK" {
            return Err(self.no_time_zone(coordinate, body.status));
        }

        let Some(zone_id) = body.time_zone_id else {
            return Err(self.no_time_zone(coordinate, "missing timeZoneId".to_string()));
        };

        let zone = TimeZoneId::parse(&zone_id)
            .map_err(|_| self.no_time_zone(coordinate, format!("unknown zone '{}'", zone_id)))?;

        self.metrics.record_resolver_request("timezone", "ok");
        Ok(zone)
    }

    fn upstream_error(&self, step: &str, message: String) -> ResolutionError {
        warn!(step = step, error = %message, "Maps upstream unavailable");
        self.metrics.record_resolver_request(step, "unavailable");
        ResolutionError::UpstreamUnavailable {
            step: step.to_string(),
            message,
        }
    }

    fn no_time_zone(&self, coordinate: GeoCoordinate, status: String) -> ResolutionError {
        warn!(
            latitude = coordinate.latitude,
            longitude = coordinate.longitude,
            status = %status,
            "Time zone lookup failed"
        );
        self.metrics.record_resolver_request("timezone", "not_found");
        ResolutionError::NoTimeZoneFound {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            status,
        }
    }
}

#[async_trait]
impl TimeZoneResolver for GoogleMapsResolver {
    async fn resolve_time_zone(
        &self,
        place: &str,
        at: DateTime<Utc>,
    ) -> Result<ResolvedTimeZone, ResolutionError> {
        let coordinate = self.geocode(place).await?;
        let zone = self.lookup_time_zone(coordinate, at).await?;

        debug!(place = place, zone = %zone, "Resolved time zone");
        Ok(ResolvedTimeZone { zone, coordinate })
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct TimeZoneResponse {
    status: String,
    #[serde(rename = "timeZoneId", default)]
    time_zone_id: Option<String>,
}
