use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use axum::extract::{MatchedPath, Request};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use shared::protocol::DEADLINE_HEADER;
use shared::types::CallCode;
use tracing::{error, info, warn};

use crate::api::error::{error_response, ApiError};
use crate::idle::IdleTracker;

// Stages, outermost first: activity, recovery, logging, deadline, handler.

/// Wrap `router` in the request pipeline. Layers added last run first.
pub fn attach(router: Router, idle: Option<Arc<IdleTracker>>, request_timeout: Duration) -> Router {
    let router = router
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            deadline_mw(request_timeout, req, next)
        }))
        .layer(middleware::from_fn(logging_mw))
        .layer(middleware::from_fn(recovery_mw));

    match idle {
        Some(tracker) if tracker.enabled() => router.layer(middleware::from_fn(move |req: Request, next: Next| {
            let tracker = Arc::clone(&tracker);
            async move { activity_mw(tracker, req, next).await }
        })),
        _ => router,
    }
}

/// Touch before delegating, so calls that go on to panic still count.
pub async fn activity_mw(tracker: Arc<IdleTracker>, req: Request, next: Next) -> Response {
    tracker.touch();
    next.run(req).await
}

/// Turn a handler panic into a well-formed internal error.
pub async fn recovery_mw(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(resp) => resp,
        Err(payload) => {
            error!(%method, %path, "Handler panicked: {}", panic_message(payload.as_ref()));
            error_response(CallCode::Internal, "internal error")
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// One event per call: method, route, duration, status and outcome.
pub async fn logging_mw(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let resp = next.run(req).await;

    let status = resp.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if resp.status().is_success() {
        info!(%method, %path, status, elapsed_ms, outcome = "ok", "call");
    } else {
        warn!(%method, %path, status, elapsed_ms, outcome = "error", "call");
    }
    resp
}

/// Caller deadline from the request headers, as unix epoch milliseconds.
fn caller_deadline(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
    let Some(value) = headers.get(DEADLINE_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(Some)
        .ok_or_else(|| ApiError::InvalidArgument(format!("malformed {} header", DEADLINE_HEADER)))
}

async fn sleep_for(budget: Option<Duration>) {
    match budget {
        Some(budget) => tokio::time::sleep(budget).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run the handler under the fixed service timeout and, if present, the
/// caller's own deadline. Expiry of the former is `deadline_exceeded`, of the
/// latter `canceled`. The abandoned handler future is simply dropped.
pub async fn deadline_mw(timeout: Duration, req: Request, next: Next) -> Response {
    let caller_budget = match caller_deadline(req.headers()) {
        Ok(None) => None,
        Ok(Some(at)) => {
            let now = chrono::Utc::now().timestamp_millis();
            if at <= now {
                return ApiError::Canceled.into_response();
            }
            Some(Duration::from_millis((at - now) as u64))
        }
        Err(e) => return e.into_response(),
    };

    tokio::select! {
        biased;
        resp = next.run(req) => resp,
        _ = tokio::time::sleep(timeout) => ApiError::DeadlineExceeded(timeout).into_response(),
        _ = sleep_for(caller_budget) => ApiError::Canceled.into_response(),
    }
}
