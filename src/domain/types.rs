//! Shared value types for the alert pipeline

use crate::domain::error::LocationError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Validated latitude/longitude pair in decimal degrees.
///
/// Construction rejects out-of-range or non-finite coordinates; nothing in the
/// pipeline clamps a bad point into range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLocation")]
pub struct LocationPoint {
    latitude: f64,
    longitude: f64,
}

/// Unvalidated wire form of a location
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RawLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, LocationError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(LocationError::LatitudeOutOfRange(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::LongitudeOutOfRange(longitude));
        }
        Ok(Self { latitude, longitude })
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl TryFrom<RawLocation> for LocationPoint {
    type Error = LocationError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl std::fmt::Display for LocationPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

/// One day of forecast, aggregated from the provider's sub-daily slots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDay {
    pub date: NaiveDate,
    /// Total precipitation for the day
    pub precipitation_mm: f64,
    /// Daily average temperature
    pub temperature_c: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    /// Daily average wind speed
    pub wind_speed_kmh: f64,
    pub humidity_pct: f64,
    pub description: String,
}

impl ForecastDay {
    /// Day with only the fields alert rules look at; the rest mirror them.
    pub fn basic(date: NaiveDate, precipitation_mm: f64, temperature_c: f64, wind_speed_kmh: f64) -> Self {
        Self {
            date,
            precipitation_mm,
            temperature_c,
            min_temperature_c: temperature_c,
            max_temperature_c: temperature_c,
            wind_speed_kmh,
            humidity_pct: 0.0,
            description: String::new(),
        }
    }
}

/// Weather for one location as served by the cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSample {
    pub origin: LocationPoint,
    pub forecast_days: Vec<ForecastDay>,
    pub fetched_at: DateTime<Utc>,
    /// Served from an expired entry after an upstream failure
    pub is_stale: bool,
    /// Upstream failure that forced the stale fallback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
}

impl WeatherSample {
    pub fn fresh(origin: LocationPoint, forecast_days: Vec<ForecastDay>) -> Self {
        Self { origin, forecast_days, fetched_at: Utc::now(), is_stale: false, stale_reason: None }
    }

    /// Copy of this sample marked stale with the reason attached
    pub fn into_stale(mut self, reason: String) -> Self {
        self.is_stale = true;
        self.stale_reason = Some(reason);
        self
    }
}

/// Alert categories, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Rain,
    Heat,
    Wind,
}

impl AlertKind {
    pub const ALL: [AlertKind; 3] = [AlertKind::Rain, AlertKind::Heat, AlertKind::Wind];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Rain => "rain",
            AlertKind::Heat => "heat",
            AlertKind::Wind => "wind",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AlertKind::Rain => "Rain expected in the next few days. Plan accordingly.",
            AlertKind::Heat => "High temperatures expected. Stay hydrated and take precautions.",
            AlertKind::Wind => "Strong winds expected. Secure outdoor items.",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn of(kind: AlertKind) -> Self {
        Self { kind, message: kind.message().to_string() }
    }
}

/// At most one alert per kind, so three fit inline
pub type Alerts = SmallVec<[Alert; 3]>;

/// Notification preference groups a user can toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    WeatherAlerts,
    WellUpdates,
    NearbyUsers,
}

/// Newtype wrapper for user IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a user the pipeline may notify.
///
/// Tokens are only valid for the run that read them; a token revoked between
/// selection and dispatch shows up as a per-token failure.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTarget {
    pub user_id: UserId,
    device_tokens: Vec<String>,
    pub location: LocationPoint,
    pub opt_in: bool,
    /// Alert kinds this user has muted inside the weather category
    pub muted_kinds: Vec<AlertKind>,
}

impl NotificationTarget {
    pub fn new(
        user_id: UserId,
        device_tokens: impl IntoIterator<Item = String>,
        location: LocationPoint,
        opt_in: bool,
    ) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for token in device_tokens {
            if !token.is_empty() && !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        Self { user_id, device_tokens: tokens, location, opt_in, muted_kinds: Vec::new() }
    }

    pub fn with_muted_kinds(mut self, kinds: Vec<AlertKind>) -> Self {
        self.muted_kinds = kinds;
        self
    }

    /// Distinct, non-empty tokens in registration order
    #[inline]
    pub fn device_tokens(&self) -> &[String] {
        &self.device_tokens
    }

    /// Whether this target wants alerts of the given kind
    pub fn wants(&self, kind: AlertKind) -> bool {
        self.opt_in && !self.muted_kinds.contains(&kind)
    }
}

/// Aggregate outcome of one logical send.
///
/// Built once by the dispatcher and never changed afterwards. The shape is the
/// same whether failures happened per chunk or per token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchResult {
    attempted: usize,
    succeeded: usize,
    failed: usize,
    per_token_errors: HashMap<String, String>,
}

impl DispatchResult {
    pub(crate) fn from_parts(
        attempted: usize,
        succeeded: usize,
        failed: usize,
        per_token_errors: HashMap<String, String>,
    ) -> Self {
        Self { attempted, succeeded, failed, per_token_errors }
    }

    #[inline]
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    #[inline]
    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    #[inline]
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Failure reason by token
    pub fn per_token_errors(&self) -> &HashMap<String, String> {
        &self.per_token_errors
    }

    /// Every attempted token failed
    pub fn is_total_failure(&self) -> bool {
        self.attempted > 0 && self.succeeded == 0
    }
}

/// Shorten a device token for logs
#[inline]
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(10) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_rejects_out_of_range() {
        assert!(LocationPoint::new(90.0, 180.0).is_ok());
        assert!(LocationPoint::new(-90.0, -180.0).is_ok());
        assert!(matches!(
            LocationPoint::new(90.5, 0.0),
            Err(LocationError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            LocationPoint::new(0.0, -180.01),
            Err(LocationError::LongitudeOutOfRange(_))
        ));
        assert!(LocationPoint::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_location_deserialize_validates() {
        let ok: LocationPoint =
            serde_json::from_str(r#"{"latitude": 45.5, "longitude": -73.6}"#).unwrap();
        assert_eq!(ok.latitude(), 45.5);

        let bad = serde_json::from_str::<LocationPoint>(r#"{"latitude": 123.0, "longitude": 0.0}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_target_dedupes_tokens() {
        let loc = LocationPoint::new(0.0, 0.0).unwrap();
        let target = NotificationTarget::new(
            UserId("u1".into()),
            vec!["a".to_string(), "b".to_string(), "a".to_string(), String::new()],
            loc,
            true,
        );
        assert_eq!(target.device_tokens(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_target_wants_respects_muted_kinds() {
        let loc = LocationPoint::new(0.0, 0.0).unwrap();
        let target = NotificationTarget::new(UserId("u1".into()), vec!["a".into()], loc, true)
            .with_muted_kinds(vec![AlertKind::Heat]);
        assert!(target.wants(AlertKind::Rain));
        assert!(!target.wants(AlertKind::Heat));

        let opted_out = NotificationTarget::new(UserId("u2".into()), vec!["b".into()], loc, false);
        assert!(!opted_out.wants(AlertKind::Rain));
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdefghijklmnop"), "abcdefghij");
        assert_eq!(token_prefix("short"), "short");
    }

    #[test]
    fn test_alert_kind_order() {
        assert_eq!(AlertKind::ALL, [AlertKind::Rain, AlertKind::Heat, AlertKind::Wind]);
        assert_eq!(Alert::of(AlertKind::Wind).message, "Strong winds expected. Secure outdoor items.");
    }
}
