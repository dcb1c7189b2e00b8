//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Provider secrets may be left out of the file and supplied through
//! `OPENWEATHER_API_KEY` and `PUSH_SERVER_KEY`.

use crate::domain::types::LocationPoint;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const WEATHER_API_KEY_ENV: &str = "OPENWEATHER_API_KEY";
pub const PUSH_SERVER_KEY_ENV: &str = "PUSH_SERVER_KEY";
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
pub const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_id")]
    pub id: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { id: default_service_id() }
    }
}

fn default_service_id() -> String {
    "well-alerts".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Upstream request timeout
    #[serde(default = "default_weather_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of 3-hour slots requested (40 = 5 days)
    #[serde(default = "default_forecast_slots")]
    pub forecast_slots: u32,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_base_url(),
            api_key: None,
            timeout_ms: default_weather_timeout_ms(),
            forecast_slots: default_forecast_slots(),
        }
    }
}

fn default_weather_base_url() -> String {
    "https://api.openweathermap.org".to_string()
}

fn default_weather_timeout_ms() -> u64 {
    5000
}

fn default_forecast_slots() -> u32 {
    40
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Freshness window for a cached sample
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Period of the eviction sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long past expiry an entry stays available as a stale fallback
    #[serde(default = "default_stale_retention_secs")]
    pub stale_retention_secs: u64,
    /// Decimal places kept in the cache key (2 = ~1.1 km cells)
    #[serde(default = "default_key_precision")]
    pub key_precision: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_retention_secs: default_stale_retention_secs(),
            key_precision: default_key_precision(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_stale_retention_secs() -> u64 {
    72 * 3600
}

/// Grid cells finer than 1e-10 degrees are pointless for weather lookups
const MAX_KEY_PRECISION: u32 = 10;

fn default_key_precision() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Rain alert when any day exceeds this total
    #[serde(default = "default_rain_mm")]
    pub rain_mm: f64,
    #[serde(default = "default_heat_c")]
    pub heat_c: f64,
    #[serde(default = "default_wind_kmh")]
    pub wind_kmh: f64,
    /// Push notification title
    #[serde(default = "default_alert_title")]
    pub title: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            rain_mm: default_rain_mm(),
            heat_c: default_heat_c(),
            wind_kmh: default_wind_kmh(),
            title: default_alert_title(),
        }
    }
}

fn default_rain_mm() -> f64 {
    5.0
}

fn default_heat_c() -> f64 {
    35.0
}

fn default_wind_kmh() -> f64 {
    30.0
}

fn default_alert_title() -> String {
    "Weather Alert".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Push gateway base URL
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub server_key: Option<String>,
    /// Provider batch limit
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunk sends allowed in flight at once
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    #[serde(default = "default_push_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            server_key: None,
            chunk_size: default_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            timeout_ms: default_push_timeout_ms(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}

fn default_max_concurrent_chunks() -> usize {
    8
}

fn default_push_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// JSON snapshot of users, locations and device tokens
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { snapshot_file: default_snapshot_file() }
    }
}

fn default_snapshot_file() -> String {
    "users.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
    /// Radius used by sites that do not set their own
    #[serde(default = "default_radius_km")]
    pub default_radius_km: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scheduler_interval_secs(),
            default_radius_km: default_radius_km(),
        }
    }
}

fn default_scheduler_interval_secs() -> u64 {
    3600
}

fn default_radius_km() -> f64 {
    30.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius_km: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A monitored location the scheduler runs cycles for
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub id: String,
    pub origin: LocationPoint,
    pub radius_km: f64,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_id: String,
    weather_base_url: String,
    weather_api_key: Option<String>,
    weather_timeout_ms: u64,
    forecast_slots: u32,
    cache_ttl_secs: u64,
    cache_sweep_interval_secs: u64,
    cache_stale_retention_secs: u64,
    cache_key_precision: u32,
    rain_threshold_mm: f64,
    heat_threshold_c: f64,
    wind_threshold_kmh: f64,
    alert_title: String,
    push_endpoint: Option<String>,
    push_server_key: Option<String>,
    push_chunk_size: usize,
    push_max_concurrent_chunks: usize,
    push_timeout_ms: u64,
    directory_snapshot_file: String,
    scheduler_interval_secs: u64,
    default_radius_km: f64,
    sites: Vec<Site>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            weather_base_url: default_weather_base_url(),
            weather_api_key: None,
            weather_timeout_ms: default_weather_timeout_ms(),
            forecast_slots: default_forecast_slots(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_sweep_interval_secs: default_sweep_interval_secs(),
            cache_stale_retention_secs: default_stale_retention_secs(),
            cache_key_precision: default_key_precision(),
            rain_threshold_mm: default_rain_mm(),
            heat_threshold_c: default_heat_c(),
            wind_threshold_kmh: default_wind_kmh(),
            alert_title: default_alert_title(),
            push_endpoint: None,
            push_server_key: None,
            push_chunk_size: default_chunk_size(),
            push_max_concurrent_chunks: default_max_concurrent_chunks(),
            push_timeout_ms: default_push_timeout_ms(),
            directory_snapshot_file: default_snapshot_file(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            default_radius_km: default_radius_km(),
            sites: Vec::new(),
            metrics_interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Config path: explicit argument, then `CONFIG_FILE`, then config/dev.toml
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }
        if let Ok(path) = env::var(CONFIG_FILE_ENV) {
            return path;
        }
        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let default_radius_km = toml_config.scheduler.default_radius_km;
        let mut sites = Vec::with_capacity(toml_config.sites.len());
        for site in toml_config.sites {
            let origin = LocationPoint::new(site.latitude, site.longitude)
                .with_context(|| format!("Invalid location for site {}", site.id))?;
            let radius_km = site.radius_km.unwrap_or(default_radius_km);
            anyhow::ensure!(
                radius_km.is_finite() && radius_km >= 0.0,
                "Invalid radius {} for site {}",
                radius_km,
                site.id
            );
            sites.push(Site { id: site.id, origin, radius_km });
        }

        anyhow::ensure!(toml_config.push.chunk_size > 0, "push.chunk_size must be positive");
        anyhow::ensure!(
            toml_config.cache.key_precision <= MAX_KEY_PRECISION,
            "cache.key_precision must be at most {MAX_KEY_PRECISION}"
        );
        anyhow::ensure!(
            toml_config.push.max_concurrent_chunks > 0,
            "push.max_concurrent_chunks must be positive"
        );

        Ok(Self {
            service_id: toml_config.service.id,
            weather_base_url: toml_config.weather.base_url,
            weather_api_key: toml_config.weather.api_key,
            weather_timeout_ms: toml_config.weather.timeout_ms,
            forecast_slots: toml_config.weather.forecast_slots,
            cache_ttl_secs: toml_config.cache.ttl_secs,
            cache_sweep_interval_secs: toml_config.cache.sweep_interval_secs,
            cache_stale_retention_secs: toml_config.cache.stale_retention_secs,
            cache_key_precision: toml_config.cache.key_precision,
            rain_threshold_mm: toml_config.alerts.rain_mm,
            heat_threshold_c: toml_config.alerts.heat_c,
            wind_threshold_kmh: toml_config.alerts.wind_kmh,
            alert_title: toml_config.alerts.title,
            push_endpoint: toml_config.push.endpoint,
            push_server_key: toml_config.push.server_key,
            push_chunk_size: toml_config.push.chunk_size,
            push_max_concurrent_chunks: toml_config.push.max_concurrent_chunks,
            push_timeout_ms: toml_config.push.timeout_ms,
            directory_snapshot_file: toml_config.directory.snapshot_file,
            scheduler_interval_secs: toml_config.scheduler.interval_secs,
            default_radius_km,
            sites,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        }
        .with_env_secrets())
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(cli: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default().with_env_secrets()
            }
        }
    }

    /// Fill secrets missing from the file from the environment
    fn with_env_secrets(mut self) -> Self {
        if self.weather_api_key.is_none() {
            self.weather_api_key = env::var(WEATHER_API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        if self.push_server_key.is_none() {
            self.push_server_key = env::var(PUSH_SERVER_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        self
    }

    /// Look up a configured site by id
    pub fn site(&self, id: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.id == id)
    }

    // Getters for all config fields
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn weather_base_url(&self) -> &str {
        &self.weather_base_url
    }

    pub fn weather_api_key(&self) -> Option<&str> {
        self.weather_api_key.as_deref()
    }

    pub fn weather_timeout(&self) -> Duration {
        Duration::from_millis(self.weather_timeout_ms)
    }

    pub fn forecast_slots(&self) -> u32 {
        self.forecast_slots
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn cache_stale_retention(&self) -> Duration {
        Duration::from_secs(self.cache_stale_retention_secs)
    }

    pub fn cache_key_precision(&self) -> u32 {
        self.cache_key_precision
    }

    pub fn rain_threshold_mm(&self) -> f64 {
        self.rain_threshold_mm
    }

    pub fn heat_threshold_c(&self) -> f64 {
        self.heat_threshold_c
    }

    pub fn wind_threshold_kmh(&self) -> f64 {
        self.wind_threshold_kmh
    }

    pub fn alert_title(&self) -> &str {
        &self.alert_title
    }

    pub fn push_endpoint(&self) -> Option<&str> {
        self.push_endpoint.as_deref()
    }

    pub fn push_server_key(&self) -> Option<&str> {
        self.push_server_key.as_deref()
    }

    pub fn push_chunk_size(&self) -> usize {
        self.push_chunk_size
    }

    pub fn push_max_concurrent_chunks(&self) -> usize {
        self.push_max_concurrent_chunks
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn directory_snapshot_file(&self) -> &str {
        &self.directory_snapshot_file
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn default_radius_km(&self) -> f64 {
        self.default_radius_km
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests and tools to point at a different weather API
    pub fn with_weather_api(mut self, base_url: &str, api_key: &str) -> Self {
        self.weather_base_url = base_url.to_string();
        self.weather_api_key = Some(api_key.to_string());
        self
    }

    /// Builder method for tests and tools to set push gateway credentials
    pub fn with_push_gateway(mut self, endpoint: &str, server_key: &str) -> Self {
        self.push_endpoint = Some(endpoint.to_string());
        self.push_server_key = Some(server_key.to_string());
        self
    }

    /// Builder method for tests to set the provider batch limit
    pub fn with_push_chunk_size(mut self, chunk_size: usize) -> Self {
        self.push_chunk_size = chunk_size.max(1);
        self
    }

    /// Builder method for tests to register sites
    pub fn with_sites(mut self, sites: Vec<Site>) -> Self {
        self.sites = sites;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.weather_timeout(), Duration::from_secs(5));
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.cache_sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.cache_key_precision(), 2);
        assert_eq!(config.rain_threshold_mm(), 5.0);
        assert_eq!(config.heat_threshold_c(), 35.0);
        assert_eq!(config.wind_threshold_kmh(), 30.0);
        assert_eq!(config.push_chunk_size(), 500);
        assert_eq!(config.push_max_concurrent_chunks(), 8);
        assert_eq!(config.push_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_radius_km(), 30.0);
        assert!(config.sites().is_empty());
    }

    #[test]
    fn test_resolve_config_path_default() {
        if env::var(CONFIG_FILE_ENV).is_err() {
            assert_eq!(Config::resolve_config_path(None), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        assert_eq!(Config::resolve_config_path(Some("config/prod.toml")), "config/prod.toml");
    }

    #[test]
    fn test_empty_toml_uses_section_defaults() {
        let parsed: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.cache.ttl_secs, 86_400);
        assert_eq!(parsed.push.chunk_size, 500);
        assert_eq!(parsed.alerts.title, "Weather Alert");
        assert!(parsed.sites.is_empty());
    }

    #[test]
    fn test_site_lookup() {
        let origin = LocationPoint::new(45.5, -73.6).unwrap();
        let config = Config::default().with_sites(vec![Site {
            id: "montreal".into(),
            origin,
            radius_km: 30.0,
        }]);
        assert!(config.site("montreal").is_some());
        assert!(config.site("quebec").is_none());
    }

    #[test]
    fn test_chunk_size_builder_never_zero() {
        let config = Config::default().with_push_chunk_size(0);
        assert_eq!(config.push_chunk_size(), 1);
    }
}
