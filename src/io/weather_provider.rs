//! Upstream weather provider
//!
//! `OpenWeatherProvider` calls the 5-day/3-hour forecast endpoint and folds
//! the slots into one `ForecastDay` per UTC date.

use crate::domain::error::WeatherError;
use crate::domain::types::{ForecastDay, LocationPoint};
use crate::infra::config::Config;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// m/s to km/h
const MS_TO_KMH: f64 = 3.6;

/// Source of forecasts for a location
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, location: &LocationPoint) -> Result<Vec<ForecastDay>, WeatherError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    list: Vec<ForecastSlot>,
}

#[derive(Debug, Deserialize)]
struct ForecastSlot {
    dt: i64,
    main: SlotMain,
    #[serde(default)]
    weather: Vec<SlotWeather>,
    #[serde(default)]
    wind: Option<SlotWind>,
    #[serde(default)]
    rain: Option<SlotRain>,
}

#[derive(Debug, Deserialize)]
struct SlotMain {
    temp: f64,
    #[serde(default)]
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct SlotWeather {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct SlotWind {
    #[serde(default)]
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct SlotRain {
    #[serde(rename = "3h", default)]
    three_hours: f64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Default)]
struct DayAccumulator {
    temps: Vec<f64>,
    humidity: Vec<f64>,
    wind_ms: Vec<f64>,
    rain_mm: f64,
    descriptions: Vec<String>,
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Group 3-hour slots by UTC date into daily summaries, oldest day first
fn aggregate_daily(slots: Vec<ForecastSlot>) -> Vec<ForecastDay> {
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();

    for slot in slots {
        let Some(ts) = DateTime::<Utc>::from_timestamp(slot.dt, 0) else {
            warn!(dt = %slot.dt, "forecast_slot_bad_timestamp");
            continue;
        };
        let day = days.entry(ts.date_naive()).or_default();
        day.temps.push(slot.main.temp);
        day.humidity.push(slot.main.humidity);
        day.wind_ms.push(slot.wind.map(|w| w.speed).unwrap_or(0.0));
        day.rain_mm += slot.rain.map(|r| r.three_hours).unwrap_or(0.0);
        for w in slot.weather {
            if !w.description.is_empty() && !day.descriptions.contains(&w.description) {
                day.descriptions.push(w.description);
            }
        }
    }

    days.into_iter()
        .map(|(date, day)| ForecastDay {
            date,
            precipitation_mm: day.rain_mm,
            temperature_c: average(&day.temps),
            min_temperature_c: day.temps.iter().copied().fold(f64::INFINITY, f64::min),
            max_temperature_c: day.temps.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            wind_speed_kmh: average(&day.wind_ms) * MS_TO_KMH,
            humidity_pct: average(&day.humidity),
            description: day.descriptions.join(", "),
        })
        .collect()
}

/// OpenWeatherMap forecast client (metric units)
#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    slots: u32,
}

impl OpenWeatherProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        slots: u32,
    ) -> Result<Self, WeatherError> {
        if api_key.is_empty() {
            return Err(WeatherError::NotConfigured("missing OpenWeather API key".to_string()));
        }
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
            slots,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, WeatherError> {
        let api_key = config.weather_api_key().ok_or_else(|| {
            WeatherError::NotConfigured("weather.api_key / OPENWEATHER_API_KEY not set".to_string())
        })?;
        Self::new(config.weather_base_url(), api_key, config.weather_timeout(), config.forecast_slots())
    }

    fn map_send_error(&self, e: reqwest::Error) -> WeatherError {
        if e.is_timeout() {
            WeatherError::Timeout(self.timeout.as_millis() as u64)
        } else {
            WeatherError::Network(e)
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn fetch(&self, location: &LocationPoint) -> Result<Vec<ForecastDay>, WeatherError> {
        let url = format!("{}/data/2.5/forecast", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", location.latitude().to_string()),
                ("lon", location.longitude().to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
                ("cnt", self.slots.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(WeatherError::Upstream { status: status.as_u16(), message });
        }

        let body = response.text().await.map_err(|e| self.map_send_error(e))?;
        let parsed: ForecastResponse =
            serde_json::from_str(&body).map_err(|e| WeatherError::Parse(e.to_string()))?;

        let slot_count = parsed.list.len();
        let days = aggregate_daily(parsed.list);
        debug!(location = %location, slots = %slot_count, days = %days.len(), "weather_fetched");
        Ok(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn montreal() -> LocationPoint {
        LocationPoint::new(45.5, -73.6).unwrap()
    }

    fn provider(uri: &str) -> OpenWeatherProvider {
        OpenWeatherProvider::new(uri, "test_key", Duration::from_secs(5), 40).unwrap()
    }

    #[test]
    fn test_missing_api_key_is_construction_error() {
        let result = OpenWeatherProvider::new("http://localhost", "", Duration::from_secs(5), 40);
        assert!(matches!(result, Err(WeatherError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_fetch_aggregates_slots_per_day() {
        let mock_server = MockServer::start().await;

        // 2024-06-01 00:00 and 03:00 UTC, then 2024-06-02 00:00 UTC
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .and(query_param("units", "metric"))
            .and(query_param("appid", "test_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "list": [
                    {
                        "dt": 1717200000,
                        "main": {"temp": 20.0, "humidity": 60},
                        "weather": [{"description": "light rain"}],
                        "wind": {"speed": 5.0},
                        "rain": {"3h": 2.5}
                    },
                    {
                        "dt": 1717210800,
                        "main": {"temp": 30.0, "humidity": 40},
                        "weather": [{"description": "moderate rain"}],
                        "wind": {"speed": 15.0},
                        "rain": {"3h": 4.0}
                    },
                    {
                        "dt": 1717286400,
                        "main": {"temp": 18.0, "humidity": 50},
                        "weather": [{"description": "clear sky"}],
                        "wind": {"speed": 2.0}
                    }
                ]
            })))
            .mount(&mock_server)
            .await;

        let days = provider(&mock_server.uri()).fetch(&montreal()).await.unwrap();

        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert!((days[0].precipitation_mm - 6.5).abs() < 1e-9);
        assert!((days[0].temperature_c - 25.0).abs() < 1e-9);
        assert_eq!(days[0].min_temperature_c, 20.0);
        assert_eq!(days[0].max_temperature_c, 30.0);
        assert!((days[0].wind_speed_kmh - 36.0).abs() < 1e-9);
        assert_eq!(days[0].description, "light rain, moderate rain");
        assert_eq!(days[1].precipitation_mm, 0.0);
    }

    #[tokio::test]
    async fn test_fetch_upstream_error_uses_body_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "cod": 401,
                "message": "Invalid API key"
            })))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).fetch(&montreal()).await.unwrap_err();
        match err {
            WeatherError::Upstream { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_malformed_body_is_parse_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server.uri()).fetch(&montreal()).await.unwrap_err();
        assert!(matches!(err, WeatherError::Parse(_)));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"list": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let provider =
            OpenWeatherProvider::new(&mock_server.uri(), "k", Duration::from_millis(50), 40).unwrap();
        let err = provider.fetch(&montreal()).await.unwrap_err();
        assert!(matches!(err, WeatherError::Timeout(50)));
    }
}
