//! Fixed-window state and the counting step.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persisted state of one client's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Requests counted in the current window
    pub hits: u64,
    /// End of the window, in milliseconds since the Unix epoch
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

impl WindowState {
    /// A window with no hits that starts at `now_ms`.
    pub fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            hits: 0,
            expires_at: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window has ended. The end instant itself still belongs to the window.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }

    /// Encode as the JSON record stored under the client's key.
    ///
    /// The Redis hit script writes the exact same layout.
    pub fn encode(&self) -> String {
        format!(r#"{{"hits":{},"expiresAt":{}}}"#, self.hits, self.expires_at)
    }

    /// Decode a stored record. Anything that is not `{hits, expiresAt}` yields `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Limits applied to every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Refresh the storage TTL on every admitted write
    pub reset_expiry_on_change: bool,
}

/// The result of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    /// Window state including this request
    pub state: WindowState,
    /// Whether the request fits in the window
    pub admitted: bool,
    /// Whether this request opened a new window
    pub rolled_over: bool,
}

impl WindowPolicy {
    /// Count one request at `now_ms` against the previously stored state.
    ///
    /// A missing or expired window is replaced by a fresh one before counting.
    /// The request is always counted, even when it ends up rejected.
    pub fn count(&self, prior: Option<WindowState>, now_ms: u64) -> Hit {
        let (mut state, rolled_over) = match prior {
            Some(state) if !state.is_expired(now_ms) => (state, false),
            _ => (WindowState::fresh(now_ms, self.window_ms), true),
        };

        state.hits = state.hits.saturating_add(1);

        Hit {
            state,
            admitted: state.hits <= self.max_requests,
            rolled_over,
        }
    }

    /// Storage TTL to write an admitted hit with.
    ///
    /// The record outlives its window by one millisecond, so it is still
    /// readable at `expires_at`, which belongs to the window. New windows and
    /// refreshing policies replace the TTL. Otherwise the record keeps the TTL
    /// it already has and only gets this one if it has none.
    pub fn write_ttl(&self, hit: &Hit, now_ms: u64) -> RecordTtl {
        let remaining = hit
            .state
            .expires_at
            .saturating_sub(now_ms)
            .saturating_add(1);
        let ttl = Duration::from_millis(remaining);

        if hit.rolled_over || self.reset_expiry_on_change {
            RecordTtl::Replace(ttl)
        } else {
            RecordTtl::KeepOr(ttl)
        }
    }
}

/// Expiry applied by a store write. Every write leaves the record with a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTtl {
    /// Replace whatever TTL the record has
    Replace(Duration),
    /// Keep the record's TTL, falling back to this one when it has none
    KeepOr(Duration),
}

impl RecordTtl {
    /// The TTL the write carries.
    pub fn duration(&self) -> Duration {
        match self {
            RecordTtl::Replace(ttl) | RecordTtl::KeepOr(ttl) => *ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(window_ms: u64, max_requests: u64) -> WindowPolicy {
        WindowPolicy {
            window_ms,
            max_requests,
            reset_expiry_on_change: false,
        }
    }

    #[test]
    fn test_fresh_window() {
        let state = WindowState::fresh(1_000, 60_000);
        assert_eq!(state.hits, 0);
        assert_eq!(state.expires_at, 61_000);
    }

    #[test]
    fn test_expiry_is_exclusive_of_end() {
        let state = WindowState { hits: 3, expires_at: 5_000 };
        assert!(!state.is_expired(4_999));
        assert!(!state.is_expired(5_000));
        assert!(state.is_expired(5_001));
    }

    #[test]
    fn test_encode_matches_serde_layout() {
        let state = WindowState { hits: 7, expires_at: 1_704_067_260_000 };
        assert_eq!(state.encode(), r#"{"hits":7,"expiresAt":1704067260000}"#);
        assert_eq!(state.encode(), serde_json::to_string(&state).unwrap());
        assert_eq!(WindowState::decode(&state.encode()), Some(state));
    }

    #[test]
    fn test_decode_malformed_records() {
        assert_eq!(WindowState::decode(""), None);
        assert_eq!(WindowState::decode("not json"), None);
        assert_eq!(WindowState::decode("42"), None);
        assert_eq!(WindowState::decode(r#"{"hits":1}"#), None);
        assert_eq!(WindowState::decode(r#"{"hits":-1,"expiresAt":10}"#), None);
        assert_eq!(WindowState::decode(r#"{"hits":"3","expiresAt":10}"#), None);
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let state = WindowState::decode(r#"{"hits":2,"expiresAt":10,"v":1}"#).unwrap();
        assert_eq!(state, WindowState { hits: 2, expires_at: 10 });
    }

    #[test]
    fn test_count_without_prior_opens_window() {
        let hit = policy(60_000, 2).count(None, 100);
        assert!(hit.admitted);
        assert!(hit.rolled_over);
        assert_eq!(hit.state, WindowState { hits: 1, expires_at: 60_100 });
    }

    #[test]
    fn test_count_within_window_keeps_expiry() {
        let prior = WindowState { hits: 1, expires_at: 60_000 };
        let hit = policy(60_000, 2).count(Some(prior), 30_000);
        assert!(hit.admitted);
        assert!(!hit.rolled_over);
        assert_eq!(hit.state, WindowState { hits: 2, expires_at: 60_000 });
    }

    #[test]
    fn test_count_over_limit_still_counts() {
        let prior = WindowState { hits: 2, expires_at: 60_000 };
        let hit = policy(60_000, 2).count(Some(prior), 30_000);
        assert!(!hit.admitted);
        assert_eq!(hit.state.hits, 3);
    }

    #[test]
    fn test_count_after_expiry_resets() {
        let prior = WindowState { hits: 50, expires_at: 60_000 };
        let hit = policy(60_000, 2).count(Some(prior), 61_000);
        assert!(hit.admitted);
        assert!(hit.rolled_over);
        assert_eq!(hit.state, WindowState { hits: 1, expires_at: 121_000 });
    }

    #[test]
    fn test_write_ttl() {
        let p = policy(60_000, 10);

        // New window: full window length plus the end instant
        let hit = p.count(None, 0);
        assert_eq!(
            p.write_ttl(&hit, 0),
            RecordTtl::Replace(Duration::from_millis(60_001))
        );

        // Continuing window without refresh keeps the stored TTL
        let hit = p.count(Some(hit.state), 10_000);
        assert_eq!(
            p.write_ttl(&hit, 10_000),
            RecordTtl::KeepOr(Duration::from_millis(50_001))
        );

        // Continuing window with refresh: time left in the window
        let refreshing = WindowPolicy { reset_expiry_on_change: true, ..p };
        assert_eq!(
            refreshing.write_ttl(&hit, 10_000),
            RecordTtl::Replace(Duration::from_millis(50_001))
        );
    }

    #[test]
    fn test_write_ttl_outlives_window_end() {
        let p = WindowPolicy { reset_expiry_on_change: true, ..policy(60_000, 10) };
        let hit = p.count(Some(WindowState { hits: 1, expires_at: 60_000 }), 60_000);

        assert!(!hit.rolled_over);
        assert_eq!(p.write_ttl(&hit, 60_000).duration(), Duration::from_millis(1));
    }
}
