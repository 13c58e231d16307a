//! Axum middleware that applies the rate limiter to each request.

use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::key::{KeyResolver, UNKNOWN_CLIENT};
use crate::ratelimit::{Decision, RateLimiter};

/// `X-RateLimit-Limit`
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What to do with a request when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorPolicy {
    /// Let the request through without rate limit headers
    #[default]
    Open,
    /// Answer 503
    Closed,
}

/// Shared state for [`rate_limit`].
#[derive(Clone)]
pub struct RateLimitState {
    /// The limiter consulted for every request
    limiter: Arc<RateLimiter>,
    /// Turns a request into a client key
    resolver: Arc<dyn KeyResolver>,
    /// Behaviour on store failure
    on_store_error: StoreErrorPolicy,
}

impl RateLimitState {
    /// Create middleware state.
    pub fn new(
        limiter: Arc<RateLimiter>,
        resolver: Arc<dyn KeyResolver>,
        on_store_error: StoreErrorPolicy,
    ) -> Self {
        Self {
            limiter,
            resolver,
            on_store_error,
        }
    }

    /// The limiter behind this middleware.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn client_key(&self, request: &Request) -> String {
        self.resolver
            .resolve(request)
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Rate limit a request, short-circuiting with 429 when the client is over its limit.
///
/// Use with [`axum::middleware::from_fn_with_state`].
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client_key = state.client_key(&request);

    match state.limiter.check(&client_key).await {
        Ok(decision) if decision.admitted => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision);
            response
        }
        Ok(decision) => {
            debug!(
                client = %client_key,
                reset_at = decision.reset_at,
                "Rejecting request over rate limit"
            );
            too_many_requests(&decision, state.limiter.now_ms())
        }
        Err(e) => match state.on_store_error {
            StoreErrorPolicy::Open => {
                warn!(client = %client_key, error = %e, "Rate limit store failed, admitting request");
                next.run(request).await
            }
            StoreErrorPolicy::Closed => {
                error!(client = %client_key, error = %e, "Rate limit store failed, rejecting request");
                (StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable\n").into_response()
            }
        },
    }
}

/// Set the three rate limit headers from a decision.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    let remaining = if decision.admitted { decision.remaining } else { 0 };
    let reset = decision
        .reset_time()
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    if let Ok(reset) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET.clone(), reset);
    }
}

/// The 429 response for a rejected decision.
fn too_many_requests(decision: &Decision, now_ms: u64) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too many requests\n").into_response();
    let headers = response.headers_mut();

    apply_headers(headers, decision);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    // Whole seconds, rounded up so clients never retry inside the window.
    let retry_after = decision.retry_after(now_ms).as_millis().div_ceil(1000) as u64;
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

    response
}
