//! Request-path integration of admission control.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/documents", get(list_documents))
//!     .layer(axum::middleware::from_fn_with_state(state, gatekeeper));
//! ```

use axum::{
    extract::{Request, State},
    http::{
        header::{HeaderName, HeaderValue, RETRY_AFTER},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use crate::{
    cache::{Decision, DecisionSource},
    identity::IdentityExtractor,
    limiter::AdmissionControl,
    metrics::Metrics,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Shared state for the [`gatekeeper`] middleware
#[derive(Clone)]
pub struct GatekeeperState {
    admission: Arc<dyn AdmissionControl>,
    extractor: Arc<dyn IdentityExtractor>,
    metrics: Arc<Metrics>,
    include_headers: bool,
}

impl GatekeeperState {
    pub fn new(
        admission: Arc<dyn AdmissionControl>,
        extractor: Arc<dyn IdentityExtractor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            admission,
            extractor,
            metrics,
            include_headers: true,
        }
    }

    pub fn with_include_headers(mut self, include_headers: bool) -> Self {
        self.include_headers = include_headers;
        self
    }
}

/// Body of a 429 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialBody {
    pub error: DenialError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialError {
    pub code: String,
    pub message: String,
    pub details: DenialDetails,
    /// Unix seconds with millisecond precision
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialDetails {
    pub limit: u64,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
}

/// Admission control middleware.
///
/// Exempt paths are forwarded untouched. Everything else is checked against
/// the admission engine; an unexpected engine fault forwards the request
/// without limiting.
pub async fn gatekeeper(
    State(state): State<GatekeeperState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if state.admission.is_exempt(&path) {
        state.metrics.record_exempt_request();
        return next.run(request).await;
    }

    let caller = state.extractor.extract(&request);

    let decision = match state.admission.check(&caller.identity, &path, caller.tier).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(error = %e, path = %path, "Admission check failed, forwarding unthrottled");
            state.metrics.record_fail_open();
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        return denial_response(&decision, state.include_headers);
    }

    let mut response = next.run(request).await;
    if state.include_headers && decision.source != DecisionSource::Disabled {
        insert_quota_headers(response.headers_mut(), &decision);
    }
    debug!(path = %path, status = %response.status(), "Request forwarded");
    response
}

fn insert_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

/// Build the 429 response for a denied decision
pub fn denial_response(decision: &Decision, include_headers: bool) -> Response {
    let retry_after = decision.retry_after.unwrap_or(decision.window_seconds);
    let body = DenialBody {
        error: DenialError {
            code: RATE_LIMIT_EXCEEDED.to_string(),
            message: format!(
                "Too many requests. Limit of {} requests per {} seconds exceeded; retry after {} seconds.",
                decision.limit, decision.window_seconds, retry_after
            ),
            details: DenialDetails {
                limit: decision.limit,
                window_seconds: decision.window_seconds,
                retry_after_seconds: retry_after,
            },
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        },
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    if include_headers {
        insert_quota_headers(headers, decision);
    }
    response
}
