//! Periodic alert runs per configured site
//!
//! Every tick starts one cycle per site on its own task. Runs are keyed by the
//! cache grid cell of the site origin: a location already in flight is
//! skipped, never preempted, so a slow run cannot be overlapped by the next
//! tick, a manual trigger or another site at the same place. On shutdown the
//! loop stops ticking, refuses new runs and waits for every guarded run to
//! finish, manual triggers included.

use crate::domain::error::PipelineError;
use crate::domain::geo::GridKey;
use crate::domain::report::CycleReport;
use crate::infra::config::Site;
use crate::services::pipeline::AlertPipeline;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// What a trigger did
#[derive(Debug)]
pub enum RunOutcome {
    Completed(CycleReport),
    /// The location already had a run in flight
    Skipped,
}

#[derive(Default)]
struct InFlightState {
    keys: HashSet<GridKey>,
    draining: bool,
}

#[derive(Default)]
struct InFlight {
    state: Mutex<InFlightState>,
    /// Signalled whenever a guarded run ends
    idle: Notify,
}

/// Releases the location when dropped
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    key: GridKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.state.lock().keys.remove(&self.key);
        self.in_flight.idle.notify_waiters();
    }
}

pub struct AlertScheduler {
    pipeline: Arc<AlertPipeline>,
    sites: Vec<Site>,
    interval: Duration,
    in_flight: Arc<InFlight>,
}

impl AlertScheduler {
    pub fn new(pipeline: Arc<AlertPipeline>, sites: Vec<Site>, interval: Duration) -> Self {
        Self { pipeline, sites, interval, in_flight: Arc::new(InFlight::default()) }
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Whether the location of `site_id` has a run in flight
    pub fn is_running(&self, site_id: &str) -> bool {
        self.sites.iter().find(|s| s.id == site_id).is_some_and(|site| {
            let key = self.pipeline.cache().key_for(&site.origin);
            self.in_flight.state.lock().keys.contains(&key)
        })
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.state.lock().keys.len()
    }

    fn try_acquire(&self, key: GridKey) -> Result<Option<InFlightGuard>, PipelineError> {
        let mut state = self.in_flight.state.lock();
        if state.draining {
            return Err(PipelineError::ShuttingDown);
        }
        if !state.keys.insert(key) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard { in_flight: self.in_flight.clone(), key }))
    }

    /// Run one cycle for a configured site unless its location is already running
    pub async fn trigger(&self, site_id: &str) -> Result<RunOutcome, PipelineError> {
        let site = self
            .sites
            .iter()
            .find(|s| s.id == site_id)
            .ok_or_else(|| PipelineError::UnknownSite(site_id.to_string()))?;
        self.run_site(site).await
    }

    async fn run_site(&self, site: &Site) -> Result<RunOutcome, PipelineError> {
        let key = self.pipeline.cache().key_for(&site.origin);
        let _guard = match self.try_acquire(key) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.pipeline.metrics().record_cycle_skipped();
                warn!(site = %site.id, key = %key, "alert_cycle_skipped_in_flight");
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => {
                warn!(site = %site.id, "alert_cycle_rejected_shutting_down");
                return Err(e);
            }
        };
        let report = self.pipeline.run_weather_alert_cycle(site.origin, site.radius_km).await?;
        Ok(RunOutcome::Completed(report))
    }

    /// Stop accepting runs and wait until none is in flight
    async fn drain(&self) {
        self.in_flight.state.lock().draining = true;
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.state.lock().keys.is_empty() {
                return;
            }
            idle.await;
        }
    }

    /// Tick until shutdown; the first tick fires immediately
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut runs: JoinSet<()> = JoinSet::new();

        info!(
            sites = %self.sites.len(),
            interval_secs = %self.interval.as_secs(),
            "alert_scheduler_started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for index in 0..self.sites.len() {
                        let scheduler = self.clone();
                        runs.spawn(async move {
                            let site = &scheduler.sites[index];
                            // Failures are logged and counted by the pipeline
                            let _ = scheduler.run_site(site).await;
                        });
                    }
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "alert_cycle_task_failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = %self.in_flight_count(), "alert_scheduler_draining");
        self.drain().await;
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "alert_cycle_task_failed");
            }
        }
        info!("alert_scheduler_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{PushError, WeatherError};
    use crate::domain::types::{ForecastDay, LocationPoint, RawLocation, UserId};
    use crate::infra::config::Config;
    use crate::infra::metrics::Metrics;
    use crate::io::directory::{
        DeviceToken, DirectoryUser, InMemoryDirectory, NotificationPreferences,
    };
    use crate::io::push::{PushMessage, PushProvider, TokenOutcome};
    use crate::io::weather_provider::WeatherProvider;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rainy forecast after a delay
    struct SlowRain {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WeatherProvider for SlowRain {
        async fn fetch(&self, _location: &LocationPoint) -> Result<Vec<ForecastDay>, WeatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
            Ok(vec![ForecastDay::basic(date, 12.0, 20.0, 10.0)])
        }
    }

    /// Delivers everything after a delay
    struct AcceptAll {
        delay: Duration,
    }

    #[async_trait]
    impl PushProvider for AcceptAll {
        async fn send(&self, token: &str, _message: &PushMessage) -> Result<String, PushError> {
            tokio::time::sleep(self.delay).await;
            Ok(token.to_string())
        }

        async fn send_multicast(
            &self,
            tokens: &[String],
            _message: &PushMessage,
        ) -> Result<Vec<TokenOutcome>, PushError> {
            tokio::time::sleep(self.delay).await;
            Ok(tokens.iter().map(|t| TokenOutcome::Delivered { message_id: t.clone() }).collect())
        }
    }

    fn site(id: &str, latitude: f64, longitude: f64) -> Site {
        Site {
            id: id.into(),
            origin: LocationPoint::new(latitude, longitude).unwrap(),
            radius_km: 30.0,
        }
    }

    fn scheduler(delay: Duration) -> (Arc<SlowRain>, Arc<Metrics>, Arc<AlertScheduler>) {
        scheduler_with_sites(
            delay,
            vec![site("montreal", 45.5, -73.6), site("laval", 45.57, -73.69)],
        )
    }

    fn scheduler_with_sites(
        delay: Duration,
        sites: Vec<Site>,
    ) -> (Arc<SlowRain>, Arc<Metrics>, Arc<AlertScheduler>) {
        scheduler_with(delay, Duration::ZERO, sites)
    }

    fn scheduler_with(
        weather_delay: Duration,
        push_delay: Duration,
        sites: Vec<Site>,
    ) -> (Arc<SlowRain>, Arc<Metrics>, Arc<AlertScheduler>) {
        let weather = Arc::new(SlowRain { delay: weather_delay, calls: AtomicUsize::new(0) });
        let directory = Arc::new(InMemoryDirectory::new(vec![DirectoryUser {
            user_id: UserId("u1".into()),
            location: Some(RawLocation { latitude: 45.51, longitude: -73.6 }),
            device_tokens: vec![DeviceToken { token: "tok-1".into(), is_active: true }],
            preferences: NotificationPreferences::default(),
        }]));
        let metrics = Arc::new(Metrics::new());
        let config = Config::default();
        let pipeline = Arc::new(AlertPipeline::from_config(
            &config,
            weather.clone(),
            Arc::new(AcceptAll { delay: push_delay }),
            directory,
            metrics.clone(),
        ));
        let scheduler =
            Arc::new(AlertScheduler::new(pipeline, sites, Duration::from_secs(3600)));
        (weather, metrics, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_runs_cycle() {
        let (_weather, _metrics, scheduler) = scheduler(Duration::from_millis(10));

        let outcome = scheduler.trigger("montreal").await.unwrap();
        match outcome {
            RunOutcome::Completed(report) => assert_eq!(report.total_attempted(), 1),
            RunOutcome::Skipped => panic!("run should not be skipped"),
        }
        assert!(!scheduler.is_running("montreal"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_skipped_while_in_flight() {
        let (_weather, metrics, scheduler) = scheduler(Duration::from_secs(2));

        let (first, second) =
            tokio::join!(scheduler.trigger("montreal"), scheduler.trigger("montreal"));

        assert!(matches!(first.unwrap(), RunOutcome::Completed(_)));
        assert!(matches!(second.unwrap(), RunOutcome::Skipped));
        assert_eq!(metrics.cycles_skipped_total(), 1);
        assert!(!scheduler.is_running("montreal"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_sites_run_concurrently() {
        let (_weather, metrics, scheduler) = scheduler(Duration::from_secs(2));

        let (a, b) = tokio::join!(scheduler.trigger("montreal"), scheduler.trigger("laval"));

        assert!(matches!(a.unwrap(), RunOutcome::Completed(_)));
        assert!(matches!(b.unwrap(), RunOutcome::Completed(_)));
        assert_eq!(metrics.cycles_skipped_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sites_sharing_origin_do_not_overlap() {
        let (weather, metrics, scheduler) = scheduler_with_sites(
            Duration::from_secs(2),
            vec![site("downtown", 45.5, -73.6), site("old-port", 45.5, -73.6)],
        );

        let (a, b) = tokio::join!(scheduler.trigger("downtown"), scheduler.trigger("old-port"));

        let outcomes = [a.unwrap(), b.unwrap()];
        let completed = outcomes.iter().filter(|o| matches!(o, RunOutcome::Completed(_))).count();
        assert_eq!(completed, 1);
        assert_eq!(metrics.cycles_skipped_total(), 1);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.dispatch_attempted_total(), 1);
        assert!(!scheduler.is_running("downtown"));
        assert!(!scheduler.is_running("old-port"));
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let (_weather, _metrics, scheduler) = scheduler(Duration::from_millis(1));
        let err = scheduler.trigger("nowhere").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSite(id) if id == "nowhere"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_ticks_and_drains_on_shutdown() {
        let (weather, metrics, scheduler) = scheduler(Duration::from_secs(3));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(rx));

        // first tick is immediate; both sites start
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running("montreal"));
        assert!(scheduler.is_running("laval"));

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!scheduler.is_running("montreal"));
        assert_eq!(weather.calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.cycles_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_manual_trigger() {
        // weather is cached after the first tick, so later runs spend their time in push
        let (weather, metrics, scheduler) = scheduler_with(
            Duration::from_secs(1),
            Duration::from_secs(2),
            vec![site("montreal", 45.5, -73.6), site("laval", 45.57, -73.69)],
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(rx));

        // first tick runs both sites to completion
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(metrics.cycles_total(), 2);

        let manual = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.trigger("montreal").await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(scheduler.is_running("montreal"));

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!scheduler.is_running("montreal"));
        assert_eq!(metrics.cycles_total(), 3);
        assert_eq!(weather.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(manual.await.unwrap().unwrap(), RunOutcome::Completed(_)));

        let err = scheduler.trigger("laval").await.unwrap_err();
        assert!(matches!(err, PipelineError::ShuttingDown));
    }
}
