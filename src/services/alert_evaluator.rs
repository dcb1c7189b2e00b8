//! Threshold rules over a weather sample
//!
//! A kind fires when any forecast day strictly exceeds its threshold. Output
//! order is fixed (rain, heat, wind) and each kind appears at most once.

use crate::domain::types::{Alert, AlertKind, Alerts, ForecastDay, WeatherSample};
use crate::infra::config::Config;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertRules {
    pub rain_mm: f64,
    pub heat_c: f64,
    pub wind_kmh: f64,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self { rain_mm: 5.0, heat_c: 35.0, wind_kmh: 30.0 }
    }
}

impl AlertRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rain_mm: config.rain_threshold_mm(),
            heat_c: config.heat_threshold_c(),
            wind_kmh: config.wind_threshold_kmh(),
        }
    }

    #[inline]
    fn exceeded(&self, kind: AlertKind, day: &ForecastDay) -> bool {
        match kind {
            AlertKind::Rain => day.precipitation_mm > self.rain_mm,
            AlertKind::Heat => day.temperature_c > self.heat_c,
            AlertKind::Wind => day.wind_speed_kmh > self.wind_kmh,
        }
    }

    /// Alerts for the sample. Stale samples are evaluated the same way.
    pub fn evaluate(&self, sample: &WeatherSample) -> Alerts {
        AlertKind::ALL
            .iter()
            .filter(|&&kind| sample.forecast_days.iter().any(|day| self.exceeded(kind, day)))
            .map(|&kind| Alert::of(kind))
            .collect()
    }
}
