//! Notification dispatcher - the only place that calls the push provider
//!
//! Tokens are cut into provider-sized chunks in input order. Chunks are sent
//! concurrently, at most `max_concurrent_chunks` at a time, each under its own
//! timeout. A chunk whose call fails marks every token in it failed with the
//! same reason; other chunks are unaffected.
//!
//! No de-duplication across calls: dispatching the same tokens twice sends
//! twice.

use crate::domain::error::PushError;
use crate::domain::types::{token_prefix, DispatchResult};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::push::{PushMessage, PushProvider, TokenOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub chunk_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { chunk_size: 500, max_concurrent_chunks: 8, chunk_timeout: Duration::from_secs(10) }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.push_chunk_size(),
            max_concurrent_chunks: config.push_max_concurrent_chunks(),
            chunk_timeout: config.push_timeout(),
        }
    }
}

/// Per-token results of one chunk, in the chunk's token order
type ChunkOutcome = Vec<Result<(), String>>;

pub struct NotificationDispatcher {
    provider: Arc<dyn PushProvider>,
    settings: DispatchSettings,
    metrics: Option<Arc<Metrics>>,
}

impl NotificationDispatcher {
    pub fn new(provider: Arc<dyn PushProvider>, settings: DispatchSettings) -> Self {
        // Never exceed what the provider accepts in one call
        let chunk_size = settings.chunk_size.clamp(1, provider.max_batch().max(1));
        let max_concurrent_chunks = settings.max_concurrent_chunks.max(1);
        Self {
            provider,
            settings: DispatchSettings { chunk_size, max_concurrent_chunks, ..settings },
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.settings.chunk_size
    }

    /// Send one notification to every token and aggregate the outcome.
    ///
    /// `attempted == tokens.len()` and `succeeded + failed == attempted`.
    pub async fn dispatch(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
        data: &HashMap<String, String>,
    ) -> DispatchResult {
        if tokens.is_empty() {
            return DispatchResult::default();
        }

        let started = Instant::now();
        let message = Arc::new(PushMessage {
            title: title.to_string(),
            body: body.to_string(),
            data: data.clone(),
        });
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_chunks));
        let mut tasks: JoinSet<(usize, ChunkOutcome)> = JoinSet::new();

        let chunks: Vec<Vec<String>> =
            tokens.chunks(self.settings.chunk_size).map(|c| c.to_vec()).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.iter().cloned().enumerate() {
            let provider = self.provider.clone();
            let message = message.clone();
            let permits = permits.clone();
            let metrics = self.metrics.clone();
            let timeout = self.settings.chunk_timeout;
            tasks.spawn(async move {
                // Semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let outcome = send_chunk(provider.as_ref(), &chunk, &message, timeout, metrics).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<ChunkOutcome>> = vec![None; chunk_count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "dispatch_chunk_task_failed"),
            }
        }

        let result = aggregate(&chunks, outcomes);
        if let Some(m) = &self.metrics {
            m.record_dispatch(&result);
        }
        info!(
            tokens = %result.attempted(),
            chunks = %chunk_count,
            succeeded = %result.succeeded(),
            failed = %result.failed(),
            elapsed_ms = %started.elapsed().as_millis(),
            "dispatch_complete"
        );
        result
    }
}

async fn send_chunk(
    provider: &dyn PushProvider,
    chunk: &[String],
    message: &PushMessage,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
) -> ChunkOutcome {
    let started = Instant::now();
    let call = async {
        if let [token] = chunk {
            provider
                .send(token, message)
                .await
                .map(|message_id| vec![TokenOutcome::Delivered { message_id }])
        } else {
            provider.send_multicast(chunk, message).await
        }
    };
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PushError::Timeout(timeout.as_millis() as u64)),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let (outcome, transport_failed) = match result {
        Ok(outcomes) => {
            if outcomes.len() != chunk.len() {
                warn!(
                    tokens = %chunk.len(),
                    outcomes = %outcomes.len(),
                    "dispatch_chunk_outcome_mismatch"
                );
            }
            let mut outcomes = outcomes.into_iter();
            let mapped: ChunkOutcome = chunk
                .iter()
                .map(|_| match outcomes.next() {
                    Some(TokenOutcome::Delivered { .. }) => Ok(()),
                    Some(TokenOutcome::Failed { reason }) => Err(reason),
                    None => Err("no outcome reported".to_string()),
                })
                .collect();
            (mapped, false)
        }
        Err(e) => {
            let reason = e.to_string();
            warn!(
                tokens = %chunk.len(),
                first_token = %chunk.first().map(|t| token_prefix(t)).unwrap_or_default(),
                error = %reason,
                "dispatch_chunk_failed"
            );
            (vec![Err(reason); chunk.len()], true)
        }
    };

    if let Some(m) = &metrics {
        m.record_chunk(latency_ms, transport_failed);
    }
    debug!(tokens = %chunk.len(), latency_ms = %latency_ms, "dispatch_chunk_sent");
    outcome
}

/// Fold per-chunk outcomes into one result; a missing chunk counts as failed
fn aggregate(chunks: &[Vec<String>], outcomes: Vec<Option<ChunkOutcome>>) -> DispatchResult {
    let mut attempted = 0;
    let mut succeeded = 0;
    let mut failed = 0;
    let mut per_token_errors = HashMap::new();

    for (chunk, outcome) in chunks.iter().zip(outcomes) {
        let outcome =
            outcome.unwrap_or_else(|| vec![Err("chunk task aborted".to_string()); chunk.len()]);
        for (token, result) in chunk.iter().zip(outcome) {
            attempted += 1;
            match result {
                Ok(()) => succeeded += 1,
                Err(reason) => {
                    failed += 1;
                    per_token_errors.insert(token.clone(), reason);
                }
            }
        }
    }

    DispatchResult::from_parts(attempted, succeeded, failed, per_token_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls; tokens starting with "bad" are rejected, chunks containing
    /// "boom" fail as a whole
    #[derive(Default)]
    struct RecordingProvider {
        single_calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        delay: Option<Duration>,
    }

    impl RecordingProvider {
        fn with_delay(delay: Duration) -> Self {
            Self { delay: Some(delay), ..Default::default() }
        }

        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PushProvider for RecordingProvider {
        async fn send(&self, token: &str, _message: &PushMessage) -> Result<String, PushError> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            self.enter().await;
            if token.starts_with("bad") {
                return Err(PushError::Rejected { status: 404, message: "unregistered".into() });
            }
            Ok(format!("m-{token}"))
        }

        async fn send_multicast(
            &self,
            tokens: &[String],
            _message: &PushMessage,
        ) -> Result<Vec<TokenOutcome>, PushError> {
            self.batches.lock().push(tokens.to_vec());
            self.enter().await;
            if tokens.iter().any(|t| t == "boom") {
                return Err(PushError::Transport("connection reset".into()));
            }
            Ok(tokens
                .iter()
                .map(|t| {
                    if t.starts_with("bad") {
                        TokenOutcome::Failed { reason: "unregistered".into() }
                    } else {
                        TokenOutcome::Delivered { message_id: format!("m-{t}") }
                    }
                })
                .collect())
        }
    }

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tok-{i:05}")).collect()
    }

    fn dispatcher(provider: Arc<RecordingProvider>, chunk_size: usize) -> NotificationDispatcher {
        NotificationDispatcher::new(
            provider,
            DispatchSettings { chunk_size, ..DispatchSettings::default() },
        )
    }

    async fn send(d: &NotificationDispatcher, tokens: &[String]) -> DispatchResult {
        d.dispatch(tokens, "Weather Alert", "body", &HashMap::new()).await
    }

    #[tokio::test]
    async fn test_chunking_preserves_order_and_counts() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider.clone(), 500);
        let all = tokens(1201);

        let result = send(&d, &all).await;

        assert_eq!(result.attempted(), 1201);
        assert_eq!(result.succeeded(), 1201);
        assert_eq!(result.failed(), 0);

        // 500 + 500 + 201
        let mut batches = provider.batches.lock().clone();
        batches.sort_by(|a, b| a[0].cmp(&b[0]));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], all[0..500].to_vec());
        assert_eq!(batches[1], all[500..1000].to_vec());
        assert_eq!(batches[2], all[1000..].to_vec());
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chunk_calls_are_ceil_of_tokens_over_size() {
        for (n, size) in [(1001, 500), (10, 3), (9, 3), (1, 500), (500, 500)] {
            let provider = Arc::new(RecordingProvider::default());
            let d = dispatcher(provider.clone(), size);
            let all = tokens(n);

            let result = send(&d, &all).await;

            let calls =
                provider.batches.lock().len() + provider.single_calls.load(Ordering::SeqCst);
            assert_eq!(calls, n.div_ceil(size), "n={n} size={size}");
            assert_eq!(result.attempted(), n);
            assert_eq!(result.succeeded() + result.failed(), result.attempted());
        }
    }

    #[tokio::test]
    async fn test_trailing_single_token_chunk_uses_single_send() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider.clone(), 500);
        let all = tokens(1001);

        let result = send(&d, &all).await;

        assert_eq!(result.attempted(), 1001);
        assert_eq!(result.succeeded(), 1001);
        assert_eq!(provider.batches.lock().len(), 2);
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chunk_failure_marks_whole_chunk_only() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider, 3);
        let mut all = tokens(6);
        all[4] = "boom".to_string();

        let result = send(&d, &all).await;

        assert_eq!(result.attempted(), 6);
        assert_eq!(result.succeeded(), 3);
        assert_eq!(result.failed(), 3);
        for token in &all[3..6] {
            assert_eq!(
                result.per_token_errors().get(token).map(String::as_str),
                Some("push transport error: connection reset")
            );
        }
    }

    #[tokio::test]
    async fn test_partial_results_unpacked() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider, 500);
        let all = vec!["good-1".to_string(), "bad-1".to_string(), "good-2".to_string()];

        let result = send(&d, &all).await;

        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.per_token_errors().get("bad-1").map(String::as_str), Some("unregistered"));
        assert!(!result.is_total_failure());
    }

    #[tokio::test]
    async fn test_single_token_uses_single_send() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider.clone(), 500);

        let result = send(&d, &["bad-token".to_string()]).await;

        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 1);
        assert!(provider.batches.lock().is_empty());
        assert!(result.is_total_failure());
        assert!(result.per_token_errors()["bad-token"].contains("unregistered"));
    }

    #[tokio::test]
    async fn test_empty_token_list_sends_nothing() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider.clone(), 500);

        let result = send(&d, &[]).await;

        assert_eq!(result.attempted(), 0);
        assert_eq!(provider.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let provider = Arc::new(RecordingProvider::with_delay(Duration::from_millis(100)));
        let d = dispatcher(provider.clone(), 2);

        let result = send(&d, &tokens(40)).await;

        assert_eq!(result.succeeded(), 40);
        assert_eq!(provider.batches.lock().len(), 20);
        assert!(provider.peak_in_flight.load(Ordering::SeqCst) <= 8);
        assert!(provider.peak_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_chunk_times_out() {
        let provider = Arc::new(RecordingProvider::with_delay(Duration::from_secs(30)));
        let d = dispatcher(provider, 500);

        let result = send(&d, &tokens(3)).await;

        assert_eq!(result.failed(), 3);
        assert!(result.per_token_errors().values().all(|r| r.contains("timed out")));
    }

    #[tokio::test]
    async fn test_chunk_size_capped_by_provider_limit() {
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(provider, 10_000);
        assert_eq!(d.chunk_size(), 500);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let provider = Arc::new(RecordingProvider::default());
        let metrics = Arc::new(Metrics::new());
        let d = dispatcher(provider, 2).with_metrics(metrics.clone());

        send(&d, &tokens(5)).await;

        assert_eq!(metrics.dispatch_attempted_total(), 5);
        assert_eq!(metrics.chunks_sent_total(), 3);
    }
}
