//! Request pipeline: correlation ids, access logs, rate limiting, deadlines
//!
//! One `from_fn` layer keeps the ordering obvious: assign the correlation
//! id, enforce the rate limit, run the handler under the request deadline,
//! then log and stamp the response.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use dashmap::DashMap;
use metrics::{counter, histogram};
use tracing::info;

use crate::error::{ControlError, ErrorEnvelope};

use super::AppState;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id attached to request extensions for handlers that want it.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Source address as seen by the listener; absent for in-process tests.
#[derive(Debug, Clone)]
pub struct SourceAddr(pub String);

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token-bucket limiter keyed by source address.
pub struct ApiRateLimiter {
    per_sec: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
}

impl ApiRateLimiter {
    pub fn new(per_sec: u32, burst: u32) -> Self {
        ApiRateLimiter {
            per_sec: per_sec as f64,
            burst: burst as f64,
            buckets: DashMap::new(),
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            refilled: now,
        });
        let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.burst);
        bucket.refilled = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn error_response(err: &ControlError, correlation_id: &str) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorEnvelope::from_error(err, Some(correlation_id.to_string()))),
    )
        .into_response()
}

pub async fn request_pipeline(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let source = request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    request.extensions_mut().insert(SourceAddr(source.clone()));

    let mut response = if !state.limiter.try_acquire(&source) {
        error_response(
            &ControlError::Overload("request rate exceeded".into()),
            &correlation_id,
        )
    } else {
        match tokio::time::timeout(state.config.request_timeout(), next.run(request)).await {
            Ok(response) => response,
            // In-flight work is dropped at the deadline; store writes are
            // atomic, so nothing partial survives.
            Err(_) => error_response(
                &ControlError::Unavailable("request deadline exceeded".into()),
                &correlation_id,
            ),
        }
    };

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    counter!(
        "fleetplane_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("fleetplane_request_seconds").record(elapsed.as_secs_f64());
    info!(
        %method,
        path,
        status,
        duration_ms = elapsed.as_millis() as u64,
        correlation_id = %correlation_id,
        source = %source,
        "request"
    );

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
