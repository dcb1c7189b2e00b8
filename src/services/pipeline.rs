//! Weather alert cycle
//!
//! One run: weather for the origin (cache, possibly stale) -> alerts -> for
//! each alert the opted-in users inside the radius -> one dispatch over their
//! de-duplicated tokens. The directory is read once per run and only when at
//! least one alert fired.

use crate::domain::error::PipelineError;
use crate::domain::report::{epoch_ms, new_run_id, AlertDispatch, CycleReport};
use crate::domain::types::{Alert, LocationPoint, NotificationTarget};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::directory::UserDirectory;
use crate::io::push::PushProvider;
use crate::io::weather_provider::WeatherProvider;
use crate::services::alert_evaluator::AlertRules;
use crate::services::audience::{filter_within_radius, AudienceSelector};
use crate::services::dispatcher::{DispatchSettings, NotificationDispatcher};
use crate::services::weather_cache::{CacheSettings, WeatherCache};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const DATA_TYPE_KEY: &str = "type";
pub const DATA_TYPE_WEATHER_ALERT: &str = "weather_alert";
pub const DATA_ALERT_TYPE_KEY: &str = "alertType";

/// Tokens of all targets, first occurrence wins
pub fn collect_tokens(targets: &[NotificationTarget]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .flat_map(|t| t.device_tokens().iter())
        .filter(|token| seen.insert(token.as_str()))
        .cloned()
        .collect()
}

fn alert_data(alert: &Alert) -> HashMap<String, String> {
    HashMap::from([
        (DATA_TYPE_KEY.to_string(), DATA_TYPE_WEATHER_ALERT.to_string()),
        (DATA_ALERT_TYPE_KEY.to_string(), alert.kind.as_str().to_string()),
    ])
}

pub struct AlertPipeline {
    cache: Arc<WeatherCache>,
    rules: AlertRules,
    audience: AudienceSelector,
    dispatcher: NotificationDispatcher,
    title: String,
    metrics: Arc<Metrics>,
}

impl AlertPipeline {
    pub fn new(
        cache: Arc<WeatherCache>,
        rules: AlertRules,
        audience: AudienceSelector,
        dispatcher: NotificationDispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { cache, rules, audience, dispatcher, title: "Weather Alert".to_string(), metrics }
    }

    /// Wire the pipeline from config and the three collaborators
    pub fn from_config(
        config: &Config,
        weather: Arc<dyn WeatherProvider>,
        push: Arc<dyn PushProvider>,
        directory: Arc<dyn UserDirectory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = Arc::new(
            WeatherCache::new(weather, CacheSettings::from_config(config))
                .with_metrics(metrics.clone()),
        );
        let dispatcher = NotificationDispatcher::new(push, DispatchSettings::from_config(config))
            .with_metrics(metrics.clone());
        Self::new(
            cache,
            AlertRules::from_config(config),
            AudienceSelector::new(directory),
            dispatcher,
            metrics,
        )
        .with_title(config.alert_title())
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn cache(&self) -> &Arc<WeatherCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Validate raw coordinates, then run a cycle
    pub async fn run_at(
        &self,
        latitude: f64,
        longitude: f64,
        radius_km: f64,
    ) -> Result<CycleReport, PipelineError> {
        let origin = LocationPoint::new(latitude, longitude)?;
        self.run_weather_alert_cycle(origin, radius_km).await
    }

    pub async fn run_weather_alert_cycle(
        &self,
        origin: LocationPoint,
        radius_km: f64,
    ) -> Result<CycleReport, PipelineError> {
        let run_id = new_run_id();
        let started_at_ms = epoch_ms();
        let started = Instant::now();
        info!(run_id = %run_id, origin = %origin, radius_km = %radius_km, "alert_cycle_started");

        match self.run_inner(&run_id, origin, radius_km).await {
            Ok((sample_stale, stale_reason, alerts)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_cycle(duration_ms, alerts.len());
                let report = CycleReport {
                    run_id,
                    started_at_ms,
                    duration_ms,
                    weather_stale: sample_stale,
                    stale_reason,
                    alerts,
                };
                info!(
                    run_id = %report.run_id,
                    alerts = %report.alerts.len(),
                    stale = %report.weather_stale,
                    attempted = %report.total_attempted(),
                    succeeded = %report.total_succeeded(),
                    failed = %report.total_failed(),
                    duration_ms = %report.duration_ms,
                    "alert_cycle_complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_cycle_failed();
                error!(run_id = %run_id, origin = %origin, error = %e, "alert_cycle_failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: &str,
        origin: LocationPoint,
        radius_km: f64,
    ) -> Result<(bool, Option<String>, Vec<AlertDispatch>), PipelineError> {
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(PipelineError::InvalidRadius(radius_km));
        }

        let sample = self.cache.get(&origin).await?;
        if sample.is_stale {
            warn!(
                run_id = %run_id,
                reason = %sample.stale_reason.as_deref().unwrap_or("unknown"),
                "alert_cycle_using_stale_weather"
            );
        }

        let alerts = self.rules.evaluate(&sample);
        if alerts.is_empty() {
            info!(run_id = %run_id, "alert_cycle_no_alerts");
            return Ok((sample.is_stale, sample.stale_reason, Vec::new()));
        }

        let population = self.audience.population().await?;
        let mut dispatches = Vec::with_capacity(alerts.len());

        for alert in alerts {
            self.metrics.record_alert_fired(alert.kind);
            let kind = alert.kind;
            let audience =
                filter_within_radius(population.clone(), &origin, radius_km, |t| t.wants(kind));
            let tokens = collect_tokens(&audience);
            info!(
                run_id = %run_id,
                alert = %kind,
                audience = %audience.len(),
                tokens = %tokens.len(),
                "alert_fired"
            );

            let result = if tokens.is_empty() {
                None
            } else {
                let result = self
                    .dispatcher
                    .dispatch(&tokens, &self.title, &alert.message, &alert_data(&alert))
                    .await;
                if result.is_total_failure() {
                    warn!(
                        run_id = %run_id,
                        alert = %kind,
                        failed = %result.failed(),
                        "alert_dispatch_failed"
                    );
                }
                Some(result)
            };

            dispatches.push(AlertDispatch { alert, audience: audience.len(), result });
        }

        Ok((sample.is_stale, sample.stale_reason, dispatches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertKind, UserId};

    fn target(id: &str, tokens: &[&str]) -> NotificationTarget {
        NotificationTarget::new(
            UserId(id.into()),
            tokens.iter().map(|t| t.to_string()),
            LocationPoint::new(0.0, 0.0).unwrap(),
            true,
        )
    }

    #[test]
    fn test_collect_tokens_dedupes_across_users() {
        let targets = vec![target("a", &["t1", "t2"]), target("b", &["t2", "t3"])];
        assert_eq!(collect_tokens(&targets), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_alert_data_payload() {
        let data = alert_data(&Alert::of(AlertKind::Heat));
        assert_eq!(data.get("type").map(String::as_str), Some("weather_alert"));
        assert_eq!(data.get("alertType").map(String::as_str), Some("heat"));
    }
}
