//! Redis-backed window store.
//!
//! Plain reads and writes go through `GET` and `SET`. The atomic hit runs a
//! Lua script invoked by SHA, which Redis loads on first use.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::ratelimit::{Hit, RecordTtl, WindowPolicy, WindowState, WindowStore};

/// Counts one request against a key in a single round trip.
///
/// KEYS[1] storage key. ARGV: now ms, window ms, max requests, refresh TTL flag.
/// Returns {admitted, hits, expires_at, rolled_over}.
const HIT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local refresh = ARGV[4] == '1'

local hits = 0
local expires_at = now + window
local rolled_over = 1

if raw then
  local ok, rec = pcall(cjson.decode, raw)
  if ok and type(rec) == 'table'
    and type(rec.hits) == 'number' and rec.hits >= 0 and rec.hits == math.floor(rec.hits)
    and type(rec.expiresAt) == 'number' and rec.expiresAt >= 0
    and rec.expiresAt == math.floor(rec.expiresAt)
    and now <= rec.expiresAt then
    hits = rec.hits
    expires_at = rec.expiresAt
    rolled_over = 0
  end
end

hits = hits + 1
if hits > max then
  return {0, hits, expires_at, rolled_over}
end

local value = string.format('{"hits":%d,"expiresAt":%d}', hits, expires_at)
local ttl = expires_at - now + 1
if rolled_over == 1 or refresh then
  redis.call('SET', KEYS[1], value, 'PX', ttl)
else
  redis.call('SET', KEYS[1], value, 'KEEPTTL')
  if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
  end
end
return {1, hits, expires_at, rolled_over}
"#;

/// Writes a record, keeping its TTL or arming ARGV[2] ms when it has none.
///
/// KEYS[1] storage key. ARGV: encoded record, fallback TTL ms.
const KEEP_TTL_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'KEEPTTL')
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
"#;

/// A window store on a Redis server.
///
/// The multiplexed connection is cloned per operation and shared by every
/// in-flight check.
#[derive(Clone)]
pub struct RedisStore {
    /// Shared connection
    connection: MultiplexedConnection,
    /// Deadline for each store operation
    operation_timeout: Duration,
    /// Atomic hit script
    hit_script: Script,
    /// Write that never leaves a record without expiry
    keep_ttl_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, operation_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let addr = client.get_connection_info().addr.to_string();

        let connection = tokio::time::timeout(
            operation_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(operation_timeout))??;

        info!(addr = %addr, "Connected to Redis window store");

        Ok(Self {
            connection,
            operation_timeout,
            hit_script: Script::new(HIT_SCRIPT),
            keep_ttl_script: Script::new(KEEP_TTL_SCRIPT),
        })
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let _: () = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    /// Run a Redis call under the operation deadline.
    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result.map_err(|e| {
                warn!(error = %e, "Redis window store call failed");
                StoreError::from(e)
            }),
            Err(_) => {
                warn!(
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Redis window store call timed out"
                );
                Err(StoreError::Timeout(self.operation_timeout))
            }
        }
    }
}

/// Milliseconds for `PX`, which rejects zero.
fn px_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = self.bounded(conn.get(key)).await?;

        Ok(raw.and_then(|raw| {
            let state = WindowState::decode(&raw);
            if state.is_none() {
                warn!(key = %key, "Malformed window record, treating as absent");
            }
            state
        }))
    }

    async fn set(
        &self,
        key: &str,
        state: &WindowState,
        ttl: RecordTtl,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();

        match ttl {
            RecordTtl::Replace(ttl) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(state.encode()).arg("PX").arg(px_millis(ttl));
                let _: () = self.bounded(cmd.query_async(&mut conn)).await?;
            }
            RecordTtl::KeepOr(ttl) => {
                let mut invocation = self.keep_ttl_script.key(key);
                invocation.arg(state.encode()).arg(px_millis(ttl));
                let _: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
            }
        }

        Ok(())
    }

    async fn hit(
        &self,
        key: &str,
        policy: &WindowPolicy,
        now_ms: u64,
    ) -> Result<Hit, StoreError> {
        let mut conn = self.connection.clone();

        let mut invocation = self.hit_script.key(key);
        invocation
            .arg(now_ms)
            .arg(policy.window_ms)
            .arg(policy.max_requests)
            .arg(if policy.reset_expiry_on_change { "1" } else { "0" });

        let (admitted, hits, expires_at, rolled_over): (u8, u64, u64, u8) =
            self.bounded(invocation.invoke_async(&mut conn)).await?;

        Ok(Hit {
            state: WindowState { hits, expires_at },
            admitted: admitted == 1,
            rolled_over: rolled_over == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_px_millis_never_zero() {
        assert_eq!(px_millis(Duration::ZERO), 1);
        assert_eq!(px_millis(Duration::from_micros(300)), 1);
        assert_eq!(px_millis(Duration::from_secs(60)), 60_000);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not-a-url", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }

    async fn live_store() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(
            RedisStore::connect(&url, Duration::from_secs(2))
                .await
                .expect("REDIS_URL should point at a reachable server"),
        )
    }

    fn unique_key(name: &str) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("turnstile-test:{}:{}", name, nanos)
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_set_get_and_keepttl() {
        let Some(store) = live_store().await else { return };
        store.ping().await.unwrap();

        let key = unique_key("setget");
        let state = WindowState { hits: 1, expires_at: 42 };

        store
            .set(&key, &state, RecordTtl::Replace(Duration::from_secs(30)))
            .await
            .unwrap();
        store
            .set(
                &key,
                &WindowState { hits: 2, ..state },
                RecordTtl::KeepOr(Duration::from_secs(300)),
            )
            .await
            .unwrap();

        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(WindowState { hits: 2, expires_at: 42 })
        );

        let mut conn = store.connection.clone();
        let ttl: i64 = conn.pttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 30_000);
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_keepttl_arms_record_without_expiry() {
        let Some(store) = live_store().await else { return };
        let key = unique_key("persistent");

        let mut conn = store.connection.clone();
        let _: () = conn.set(&key, "{}").await.unwrap();

        let state = WindowState { hits: 1, expires_at: 42 };
        store
            .set(&key, &state, RecordTtl::KeepOr(Duration::from_secs(30)))
            .await
            .unwrap();

        let ttl: i64 = conn.pttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 30_000);
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_fractional_expiry_reads_as_malformed() {
        let Some(store) = live_store().await else { return };
        let key = unique_key("fractional");

        let mut conn = store.connection.clone();
        let _: () = conn
            .set_ex(&key, r#"{"hits":1,"expiresAt":5000.5}"#, 30)
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);

        let policy = WindowPolicy {
            window_ms: 10_000,
            max_requests: 2,
            reset_expiry_on_change: false,
        };
        let hit = store.hit(&key, &policy, 1_000).await.unwrap();
        assert!(hit.rolled_over);
        assert_eq!(hit.state, WindowState { hits: 1, expires_at: 11_000 });
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_malformed_record_reads_as_absent() {
        let Some(store) = live_store().await else { return };
        let key = unique_key("malformed");

        let mut conn = store.connection.clone();
        let _: () = conn.set_ex(&key, "garbage", 30).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);

        let policy = WindowPolicy {
            window_ms: 10_000,
            max_requests: 2,
            reset_expiry_on_change: false,
        };
        let hit = store.hit(&key, &policy, 1_000).await.unwrap();
        assert!(hit.admitted);
        assert!(hit.rolled_over);
        assert_eq!(hit.state, WindowState { hits: 1, expires_at: 11_000 });
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_atomic_hit_matches_policy() {
        let Some(store) = live_store().await else { return };
        let key = unique_key("hit");
        let policy = WindowPolicy {
            window_ms: 60_000,
            max_requests: 2,
            reset_expiry_on_change: false,
        };

        let now = chrono::Utc::now().timestamp_millis() as u64;
        let mut expected = None;
        for offset in [0, 10, 20] {
            let hit = store.hit(&key, &policy, now + offset).await.unwrap();
            let want = policy.count(expected, now + offset);
            assert_eq!(hit, want);
            if want.admitted {
                expected = Some(want.state);
            }
        }

        // The rejected hit was not written
        assert_eq!(store.get(&key).await.unwrap().unwrap().hits, 2);

        // The record outlives the window end by one millisecond
        let mut conn = store.connection.clone();
        let ttl: i64 = conn.pttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60_001);
    }
}
