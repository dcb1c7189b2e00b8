//! Mock push gateway
//!
//! Simulates the push gateway `HttpPushProvider` talks to, for local runs.
//!
//! Protocol (JSON over HTTP/1.1):
//! - `POST /send` with `{"token", "notification", "android", "apns"}`
//!   answers `{"message_id"}`
//! - `POST /send-multicast` with `{"tokens", ...}` answers
//!   `{"responses": [{"success", "message_id"?, "error"?}]}` in token order
//!
//! Behavior:
//! 1. Listens on configurable port (default 8088)
//! 2. Tokens starting with `--revoked-prefix` fail as `unregistered`
//! 3. With `--require-key`, requests without `Authorization: key=<key>` get 401
//! 4. Multicast with more than 500 tokens gets 400
//!
//! Usage:
//!   cargo run --bin mock-push -- --port 8088 --require-key dev-key

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use well_alerts::domain::types::token_prefix;
use well_alerts::io::push::{
    ErrorResponse, MulticastRequest, MulticastResponse, SendRequest, SendResponse, WireOutcome,
    MAX_MULTICAST_TOKENS,
};

#[derive(Parser, Debug)]
#[command(name = "mock-push")]
#[command(about = "Mock push gateway for local simulation")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8088")]
    port: u16,

    /// Tokens with this prefix are reported as unregistered
    #[arg(long, default_value = "revoked")]
    revoked_prefix: String,

    /// Server key expected in the Authorization header
    #[arg(long)]
    require_key: Option<String>,
}

struct MockGateway {
    revoked_prefix: String,
    require_key: Option<String>,
    next_id: AtomicU64,
}

impl MockGateway {
    fn message_id(&self) -> String {
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn outcome(&self, token: &str) -> WireOutcome {
        if token.starts_with(&self.revoked_prefix) {
            WireOutcome { success: false, message_id: None, error: Some("unregistered".into()) }
        } else {
            WireOutcome { success: true, message_id: Some(self.message_id()), error: None }
        }
    }

    fn authorized(&self, req: &Request<Incoming>) -> bool {
        let Some(key) = &self.require_key else {
            return true;
        };
        req.headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("key="))
            .is_some_and(|v| v == key)
    }
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json(status, &ErrorResponse { error: message.to_string() })
}

async fn handle(
    gateway: Arc<MockGateway>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        return Ok(error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    if !gateway.authorized(&req) {
        warn!("mock_push_unauthorized");
        return Ok(error(StatusCode::UNAUTHORIZED, "invalid server key"));
    }

    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(error(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    let response = match path.as_str() {
        "/send" => match serde_json::from_slice::<SendRequest>(&body) {
            Ok(request) => {
                let outcome = gateway.outcome(&request.token);
                info!(
                    token = %token_prefix(&request.token),
                    title = %request.notification.title,
                    success = %outcome.success,
                    "mock_push_send"
                );
                match outcome.message_id {
                    Some(message_id) => json(StatusCode::OK, &SendResponse { message_id }),
                    None => error(StatusCode::NOT_FOUND, "unregistered"),
                }
            }
            Err(e) => error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        "/send-multicast" => match serde_json::from_slice::<MulticastRequest>(&body) {
            Ok(request) if request.tokens.len() > MAX_MULTICAST_TOKENS => {
                error(StatusCode::BAD_REQUEST, "too many tokens")
            }
            Ok(request) => {
                let responses: Vec<WireOutcome> =
                    request.tokens.iter().map(|t| gateway.outcome(t)).collect();
                let delivered = responses.iter().filter(|r| r.success).count();
                info!(
                    tokens = %request.tokens.len(),
                    delivered = %delivered,
                    failed = %(request.tokens.len() - delivered),
                    title = %request.notification.title,
                    "mock_push_multicast"
                );
                json(StatusCode::OK, &MulticastResponse { responses })
            }
            Err(e) => error(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        _ => error(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let gateway = Arc::new(MockGateway {
        revoked_prefix: args.revoked_prefix,
        require_key: args.require_key,
        next_id: AtomicU64::new(1),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        addr = %addr,
        revoked_prefix = %gateway.revoked_prefix,
        auth = %gateway.require_key.is_some(),
        "mock_push_listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| handle(gateway.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                warn!(peer = %peer, error = %e, "mock_push_connection_error");
            }
        });
    }
}
