//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{two_step_hit, WindowStore};
use super::clock::{Clock, SystemClock};
use super::window::{Hit, WindowPolicy};
use crate::error::{Result, StoreError, TurnstileError};

/// Namespace prepended to every client key in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "rate-limit:";
/// Default window length when none is configured.
const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Default number of requests per window when none is configured.
const DEFAULT_MAX_REQUESTS: u64 = 100;

/// How a check talks to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Separate read and write. Concurrent bursts from one client can
    /// overshoot the limit by the number of requests in flight.
    #[default]
    BestEffort,
    /// One combined store operation per check.
    Atomic,
}

/// Options for a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests admitted per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Prefix for keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Refresh the record's storage TTL on every admitted request
    #[serde(default)]
    pub reset_expiry_on_change: bool,

    /// Read-modify-write strategy
    #[serde(default)]
    pub consistency: Consistency,
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MS, DEFAULT_MAX_REQUESTS)
    }
}

impl LimiterOptions {
    /// Options for `max_requests` per `window_ms`, everything else default.
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            key_prefix: default_key_prefix(),
            reset_expiry_on_change: false,
            consistency: Consistency::default(),
        }
    }

    /// Reject options no window can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn policy(&self) -> WindowPolicy {
        WindowPolicy {
            window_ms: self.window_ms,
            max_requests: self.max_requests,
            reset_expiry_on_change: self.reset_expiry_on_change,
        }
    }
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Requests admitted per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// End of the current window, in milliseconds since the Unix epoch
    pub reset_at: u64,
}

impl Decision {
    fn from_hit(hit: &Hit, limit: u64) -> Self {
        Self {
            admitted: hit.admitted,
            limit,
            remaining: limit.saturating_sub(hit.state.hits),
            reset_at: hit.state.expires_at,
        }
    }

    /// The window end as a UTC timestamp.
    pub fn reset_time(&self) -> DateTime<Utc> {
        i64::try_from(self.reset_at)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Time left until the window ends.
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at.saturating_sub(now_ms))
    }
}

/// Fixed-window rate limiter over a shared store.
///
/// The limiter keeps no per-client state of its own; every check reads the
/// store and, when the request is admitted, writes it back.
pub struct RateLimiter {
    /// Where window state lives
    store: Arc<dyn WindowStore>,
    /// Validated options
    options: LimiterOptions,
    /// Limits derived from the options
    policy: WindowPolicy,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("options", &self.options)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter on the system clock.
    pub fn new(store: Arc<dyn WindowStore>, options: LimiterOptions) -> Result<Self> {
        Self::with_clock(store, options, Arc::new(SystemClock))
    }

    /// Create a rate limiter on the given clock.
    pub fn with_clock(
        store: Arc<dyn WindowStore>,
        options: LimiterOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        let policy = options.policy();

        Ok(Self {
            store,
            options,
            policy,
            clock,
        })
    }

    /// The options this limiter was built with.
    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Current time on the limiter's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The store key a client's window lives under.
    pub fn storage_key(&self, client_key: &str) -> String {
        format!("{}{}", self.options.key_prefix, client_key)
    }

    /// Count a request from `client_key` and decide whether it may proceed.
    ///
    /// Rejected requests are counted in the returned decision but not
    /// written back. Store failures are returned as-is; whether that admits
    /// the request is up to the caller.
    pub async fn check(&self, client_key: &str) -> std::result::Result<Decision, StoreError> {
        let key = self.storage_key(client_key);
        let now = self.clock.now_ms();

        trace!(
            key = %key,
            now = now,
            "Checking rate limit"
        );

        let hit = match self.options.consistency {
            Consistency::BestEffort => {
                two_step_hit(self.store.as_ref(), &key, &self.policy, now).await?
            }
            Consistency::Atomic => self.store.hit(&key, &self.policy, now).await?,
        };

        if hit.rolled_over {
            debug!(
                key = %key,
                expires_at = hit.state.expires_at,
                "Starting new rate limit window"
            );
        }

        if !hit.admitted {
            debug!(
                key = %key,
                hits = hit.state.hits,
                limit = self.options.max_requests,
                "Rate limit exceeded"
            );
        }

        Ok(Decision::from_hit(&hit, self.options.max_requests))
    }
}
