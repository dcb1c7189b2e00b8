//! Prometheus metrics and manual trigger HTTP endpoint
//!
//! Routes:
//! - `GET /metrics` - Prometheus text format
//! - `GET /health`
//! - `POST /sites/{id}/run` - run one alert cycle for a configured site
//!
//! Uses hyper for the HTTP server.

use crate::domain::error::PipelineError;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::scheduler::{AlertScheduler, RunOutcome};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    service: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ =
            writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, service: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(8192);

    write_cycle_metrics(&mut output, service, &summary);
    write_alert_metrics(&mut output, service, &summary);
    write_cache_metrics(&mut output, service, &summary);
    write_dispatch_metrics(&mut output, service, &summary);

    output
}

fn write_cycle_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "well_alerts_cycles_total",
        "Alert cycles run",
        MetricType::Counter,
        service,
        summary.cycles_total,
    );
    write_metric(
        output,
        "well_alerts_cycles_failed_total",
        "Alert cycles aborted with an error",
        MetricType::Counter,
        service,
        summary.cycles_failed_total,
    );
    write_metric(
        output,
        "well_alerts_cycles_skipped_total",
        "Triggers skipped because the site was already running",
        MetricType::Counter,
        service,
        summary.cycles_skipped_total,
    );
    write_metric(
        output,
        "well_alerts_cycles_no_alert_total",
        "Cycles where no threshold was crossed",
        MetricType::Counter,
        service,
        summary.cycles_no_alert_total,
    );
    write_histogram(
        output,
        "well_alerts_cycle_duration_ms",
        "Alert cycle duration in milliseconds",
        service,
        &summary.cycle_buckets,
        summary.cycle_avg_ms,
    );
    write_metric(
        output,
        "well_alerts_cycle_duration_p99_ms",
        "99th percentile cycle duration",
        MetricType::Gauge,
        service,
        summary.cycle_p99_ms,
    );
}

fn write_alert_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP well_alerts_alerts_fired_total Alerts fired by kind");
    let _ = writeln!(output, "# TYPE well_alerts_alerts_fired_total counter");
    for (kind, val) in [
        ("rain", summary.rain_alerts_total),
        ("heat", summary.heat_alerts_total),
        ("wind", summary.wind_alerts_total),
    ] {
        let _ = writeln!(
            output,
            "well_alerts_alerts_fired_total{{service=\"{service}\",kind=\"{kind}\"}} {val}"
        );
    }
}

fn write_cache_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "well_alerts_cache_hits_total",
        "Weather lookups served fresh from cache",
        MetricType::Counter,
        service,
        summary.cache_hits_total,
    );
    write_metric(
        output,
        "well_alerts_cache_misses_total",
        "Weather lookups that went upstream",
        MetricType::Counter,
        service,
        summary.cache_misses_total,
    );
    write_metric(
        output,
        "well_alerts_cache_stale_total",
        "Expired samples served after a failed refresh",
        MetricType::Counter,
        service,
        summary.cache_stale_total,
    );
    write_metric(
        output,
        "well_alerts_cache_evicted_total",
        "Entries removed by the sweep",
        MetricType::Counter,
        service,
        summary.cache_evicted_total,
    );
    write_metric(
        output,
        "well_alerts_cache_entries",
        "Cache size at the last sweep",
        MetricType::Gauge,
        service,
        summary.cache_entries,
    );
    write_metric(
        output,
        "well_alerts_upstream_errors_total",
        "Failed weather fetches",
        MetricType::Counter,
        service,
        summary.upstream_errors_total,
    );
}

fn write_dispatch_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "well_alerts_tokens_attempted_total",
        "Device tokens handed to the dispatcher",
        MetricType::Counter,
        service,
        summary.dispatch_attempted_total,
    );
    write_metric(
        output,
        "well_alerts_tokens_succeeded_total",
        "Device tokens delivered",
        MetricType::Counter,
        service,
        summary.dispatch_succeeded_total,
    );
    write_metric(
        output,
        "well_alerts_tokens_failed_total",
        "Device tokens that failed",
        MetricType::Counter,
        service,
        summary.dispatch_failed_total,
    );
    let _ = writeln!(output, "# HELP well_alerts_tokens_per_sec Tokens dispatched per second");
    let _ = writeln!(output, "# TYPE well_alerts_tokens_per_sec gauge");
    let _ = writeln!(
        output,
        "well_alerts_tokens_per_sec{{service=\"{service}\"}} {:.2}",
        summary.tokens_per_sec
    );
    write_metric(
        output,
        "well_alerts_chunks_sent_total",
        "Chunk calls made to the push provider",
        MetricType::Counter,
        service,
        summary.chunks_sent_total,
    );
    write_metric(
        output,
        "well_alerts_chunks_failed_total",
        "Chunk calls that failed as a whole",
        MetricType::Counter,
        service,
        summary.chunks_failed_total,
    );
    write_histogram(
        output,
        "well_alerts_chunk_latency_ms",
        "Push chunk send latency in milliseconds",
        service,
        &summary.chunk_buckets,
        summary.chunk_avg_ms,
    );
    write_metric(
        output,
        "well_alerts_chunk_latency_p50_ms",
        "50th percentile chunk send latency",
        MetricType::Gauge,
        service,
        summary.chunk_p50_ms,
    );
    write_metric(
        output,
        "well_alerts_chunk_latency_p99_ms",
        "99th percentile chunk send latency",
        MetricType::Gauge,
        service,
        summary.chunk_p99_ms,
    );
    write_metric(
        output,
        "well_alerts_chunk_latency_max_ms",
        "Maximum chunk send latency",
        MetricType::Gauge,
        service,
        summary.chunk_max_ms,
    );
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// `/sites/{id}/run` -> `id`
fn site_run_path(path: &str) -> Option<&str> {
    path.strip_prefix("/sites/")?
        .strip_suffix("/run")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

async fn handle_trigger(
    scheduler: Option<Arc<AlertScheduler>>,
    site_id: &str,
) -> Response<Full<Bytes>> {
    let Some(scheduler) = scheduler else {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"ok":false,"error":"scheduler_not_configured"}"#.to_string(),
        );
    };

    info!(site = %site_id, "manual_trigger");
    match scheduler.trigger(site_id).await {
        Ok(RunOutcome::Completed(report)) => {
            let body = serde_json::json!({ "ok": true, "report": report });
            json_response(StatusCode::OK, body.to_string())
        }
        Ok(RunOutcome::Skipped) => json_response(
            StatusCode::CONFLICT,
            r#"{"ok":false,"error":"already_running"}"#.to_string(),
        ),
        Err(PipelineError::UnknownSite(_)) => json_response(
            StatusCode::NOT_FOUND,
            r#"{"ok":false,"error":"unknown_site"}"#.to_string(),
        ),
        Err(PipelineError::ShuttingDown) => json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"ok":false,"error":"shutting_down"}"#.to_string(),
        ),
        Err(e) => {
            let body = serde_json::json!({ "ok": false, "error": e.to_string() });
            json_response(StatusCode::BAD_GATEWAY, body.to_string())
        }
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    service: Arc<String>,
    scheduler: Option<Arc<AlertScheduler>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let response = match (req.method(), path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &service);
            let mut response = text_response(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::POST, _) => match site_run_path(path) {
            Some(site_id) => handle_trigger(scheduler, site_id).await,
            None => text_response(StatusCode::NOT_FOUND, "Not Found"),
        },
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Start the metrics and trigger HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    service: String,
    scheduler: Option<Arc<AlertScheduler>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service = Arc::new(service);

    info!(port = %port, service = %service, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let service = service.clone();
                        let scheduler = scheduler.clone();

                        tokio::spawn(async move {
                            let svc = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let service = service.clone();
                                let scheduler = scheduler.clone();
                                async move { handle_request(req, metrics, service, scheduler).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, svc)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertKind, DispatchResult};
    use std::collections::HashMap;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_cycle(150, 1);
        metrics.record_alert_fired(AlertKind::Rain);
        metrics.record_cache_miss();
        metrics.record_chunk(120, false);
        metrics.record_dispatch(&DispatchResult::from_parts(2, 2, 0, HashMap::new()));

        let output = format_prometheus_metrics(&metrics, "well-alerts");

        assert!(output.contains("well_alerts_cycles_total{service=\"well-alerts\"} 1"));
        assert!(output.contains("well_alerts_cycle_duration_ms_bucket{service=\"well-alerts\""));
        assert!(output
            .contains("well_alerts_alerts_fired_total{service=\"well-alerts\",kind=\"rain\"} 1"));
        assert!(output.contains("well_alerts_cache_misses_total{service=\"well-alerts\"} 1"));
        assert!(output.contains("well_alerts_tokens_attempted_total{service=\"well-alerts\"} 2"));
        assert!(output.contains("well_alerts_chunk_latency_ms_count{service=\"well-alerts\"} 1"));
    }

    #[test]
    fn test_site_run_path() {
        assert_eq!(site_run_path("/sites/montreal/run"), Some("montreal"));
        assert_eq!(site_run_path("/sites//run"), None);
        assert_eq!(site_run_path("/sites/a/b/run"), None);
        assert_eq!(site_run_path("/metrics"), None);
    }
}
