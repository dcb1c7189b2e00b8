//! Weather cache with TTL and stale fallback
//!
//! Samples are keyed by `GridKey`, so requests from the same ~1 km cell share
//! one upstream call. An entry is fresh for `ttl`; after that the next `get`
//! refetches. If the refetch fails the expired sample is served with
//! `is_stale = true` until it is older than `ttl + stale_retention`, at which
//! point the sweep removes it.
//!
//! The map lock is never held across an await. Two concurrent misses for the
//! same key both fetch and the later write wins.

use crate::domain::error::WeatherError;
use crate::domain::geo::GridKey;
use crate::domain::types::{LocationPoint, WeatherSample};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::weather_provider::WeatherProvider;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache tunables
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub stale_retention: Duration,
    pub key_precision: u32,
    pub fetch_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            stale_retention: Duration::from_secs(72 * 3600),
            key_precision: 2,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: config.cache_ttl(),
            stale_retention: config.cache_stale_retention(),
            key_precision: config.cache_key_precision(),
            fetch_timeout: config.weather_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    sample: WeatherSample,
    stored_at: Instant,
}

/// Snapshot taken by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub evicted: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct WeatherCache {
    provider: Arc<dyn WeatherProvider>,
    settings: CacheSettings,
    entries: RwLock<FxHashMap<GridKey, CacheEntry>>,
    /// Since last sweep
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Arc<Metrics>>,
    closed: watch::Sender<bool>,
}

impl WeatherCache {
    pub fn new(provider: Arc<dyn WeatherProvider>, settings: CacheSettings) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            provider,
            settings,
            entries: RwLock::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: None,
            closed,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[inline]
    pub fn key_for(&self, location: &LocationPoint) -> GridKey {
        GridKey::new(location, self.settings.key_precision)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Weather for `location`, fresh from cache, refetched, or stale.
    ///
    /// Errors only when the refresh failed and there is no retained entry to
    /// fall back on.
    pub async fn get(&self, location: &LocationPoint) -> Result<WeatherSample, WeatherError> {
        let key = self.key_for(location);
        let cached = self.entries.read().get(&key).cloned();

        if let Some(entry) = &cached {
            if entry.stored_at.elapsed() < self.settings.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.record_cache_hit();
                }
                debug!(key = %key, "weather_cache_hit");
                return Ok(entry.sample.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_cache_miss();
        }

        match self.fetch_upstream(location).await {
            Ok(days) => {
                let sample = WeatherSample::fresh(*location, days);
                self.entries
                    .write()
                    .insert(key, CacheEntry { sample: sample.clone(), stored_at: Instant::now() });
                info!(key = %key, days = %sample.forecast_days.len(), "weather_cache_refreshed");
                Ok(sample)
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_upstream_error();
                }
                let reason = e.to_string();
                let usable = cached
                    .filter(|entry| entry.stored_at.elapsed() <= self.retention_horizon());
                match usable {
                    Some(entry) => {
                        if let Some(m) = &self.metrics {
                            m.record_cache_stale();
                        }
                        warn!(
                            key = %key,
                            age_secs = %entry.stored_at.elapsed().as_secs(),
                            reason = %reason,
                            "weather_cache_stale_fallback"
                        );
                        Ok(entry.sample.into_stale(reason))
                    }
                    None => {
                        warn!(key = %key, reason = %reason, "weather_unavailable");
                        Err(WeatherError::Unavailable { key: key.to_string(), reason })
                    }
                }
            }
        }
    }

    async fn fetch_upstream(
        &self,
        location: &LocationPoint,
    ) -> Result<Vec<crate::domain::types::ForecastDay>, WeatherError> {
        let timeout = self.settings.fetch_timeout;
        match tokio::time::timeout(timeout, self.provider.fetch(location)).await {
            Ok(result) => result,
            Err(_) => Err(WeatherError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Age past which an entry is no longer served even as stale
    #[inline]
    fn retention_horizon(&self) -> Duration {
        self.settings.ttl + self.settings.stale_retention
    }

    /// Drop entries past the retention horizon, log and reset hit/miss counts.
    pub fn sweep(&self) -> CacheStats {
        let horizon = self.retention_horizon();
        let (evicted, entries) = {
            let mut map = self.entries.write();
            let before = map.len();
            map.retain(|_, entry| entry.stored_at.elapsed() <= horizon);
            (before - map.len(), map.len())
        };

        let stats = CacheStats {
            entries,
            evicted,
            hits: self.hits.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
        };

        if let Some(m) = &self.metrics {
            m.record_cache_sweep(evicted, entries);
        }
        info!(
            entries = %stats.entries,
            evicted = %stats.evicted,
            hits = %stats.hits,
            misses = %stats.misses,
            "weather_cache_sweep"
        );
        stats
    }

    /// Run `sweep` every `interval` until shutdown or `close()`
    pub fn spawn_sweeper(
        cache: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut closed = cache.closed.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            info!(interval_secs = %interval.as_secs(), "weather_cache_sweeper_started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = closed.changed() => {
                        if *closed.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("weather_cache_sweeper_stopped");
        })
    }

    /// Stop the sweeper and drop every entry
    pub fn close(&self) {
        self.closed.send_replace(true);
        let dropped = {
            let mut map = self.entries.write();
            let n = map.len();
            map.clear();
            n
        };
        info!(dropped = %dropped, "weather_cache_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ForecastDay;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeProvider {
        calls: AtomicUsize,
        fail: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl WeatherProvider for FakeProvider {
        async fn fetch(&self, _location: &LocationPoint) -> Result<Vec<ForecastDay>, WeatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(WeatherError::Upstream { status: 503, message: "down".into() });
            }
            let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
            Ok(vec![ForecastDay::basic(date, 1.0, 20.0, 10.0)])
        }
    }

    fn setup() -> (Arc<FakeProvider>, WeatherCache) {
        let provider = Arc::new(FakeProvider::default());
        let settings = CacheSettings {
            ttl: Duration::from_secs(3600),
            stale_retention: Duration::from_secs(7200),
            key_precision: 2,
            fetch_timeout: Duration::from_secs(5),
        };
        let cache = WeatherCache::new(provider.clone(), settings);
        (provider, cache)
    }

    fn here() -> LocationPoint {
        LocationPoint::new(45.5, -73.6).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_skips_provider() {
        let (provider, cache) = setup();

        let first = cache.get(&here()).await.unwrap();
        tokio::time::advance(Duration::from_secs(3599)).await;
        let second = cache.get(&here()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(!second.is_stale);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let (provider, cache) = setup();

        cache.get(&here()).await.unwrap();
        tokio::time::advance(Duration::from_secs(3601)).await;
        let sample = cache.get(&here()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(!sample.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nearby_points_share_cell() {
        let (provider, cache) = setup();

        cache.get(&LocationPoint::new(45.501, -73.601).unwrap()).await.unwrap();
        cache.get(&LocationPoint::new(45.504, -73.598).unwrap()).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_serves_stale() {
        let (provider, cache) = setup();

        cache.get(&here()).await.unwrap();
        tokio::time::advance(Duration::from_secs(4000)).await;
        provider.fail.store(true, Ordering::SeqCst);

        let sample = cache.get(&here()).await.unwrap();
        assert!(sample.is_stale);
        assert!(sample.stale_reason.as_deref().unwrap().contains("503"));
        assert_eq!(sample.forecast_days.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_without_entry_is_error() {
        let (provider, cache) = setup();
        provider.fail.store(true, Ordering::SeqCst);

        let err = cache.get(&here()).await.unwrap_err();
        match err {
            WeatherError::Unavailable { key, reason } => {
                assert_eq!(key, "45.50,-73.60");
                assert!(reason.contains("down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_times_out() {
        let (provider, cache) = setup();
        provider.hang.store(true, Ordering::SeqCst);

        let err = cache.get(&here()).await.unwrap_err();
        match err {
            WeatherError::Unavailable { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_not_served_past_retention() {
        let (provider, cache) = setup();

        cache.get(&here()).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600 + 7200 + 1)).await;
        provider.fail.store(true, Ordering::SeqCst);

        assert!(matches!(cache.get(&here()).await, Err(WeatherError::Unavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_and_resets_stats() {
        let (_provider, cache) = setup();

        let old = LocationPoint::new(10.0, 10.0).unwrap();
        cache.get(&old).await.unwrap();
        tokio::time::advance(Duration::from_secs(9000)).await;

        cache.get(&here()).await.unwrap();
        cache.get(&here()).await.unwrap();
        // `old` is past retention, `here` only past ttl
        tokio::time::advance(Duration::from_secs(4000)).await;

        let stats = cache.sweep();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);

        let stats = cache.sweep();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_recorded() {
        let provider = Arc::new(FakeProvider::default());
        let metrics = Arc::new(Metrics::new());
        let cache = WeatherCache::new(provider.clone(), CacheSettings::default())
            .with_metrics(metrics.clone());

        cache.get(&here()).await.unwrap();
        cache.get(&here()).await.unwrap();

        assert_eq!(metrics.cache_misses_total(), 1);
        assert_eq!(metrics.cache_hits_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_sweeper_and_clears() {
        let (_provider, cache) = setup();
        let cache = Arc::new(cache);
        cache.get(&here()).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let handle = WeatherCache::spawn_sweeper(cache.clone(), Duration::from_secs(60), rx);

        cache.close();
        assert!(cache.is_empty());
        handle.await.unwrap();
    }
}
