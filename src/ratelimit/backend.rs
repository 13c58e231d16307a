//! Storage contract for window state.

use async_trait::async_trait;

use super::window::{Hit, RecordTtl, WindowPolicy, WindowState};
use crate::error::StoreError;

/// Trait for key-value stores that hold window state.
///
/// Implementations are shared by every in-flight check and must tolerate
/// concurrent use without external locking.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Look up the state stored under `key`.
    ///
    /// Missing, evicted and malformed records all read as `None`.
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError>;

    /// Store `state` under `key`.
    ///
    /// The record always ends up with an expiry: `ttl` either replaces the
    /// current one or only applies when the record has none.
    async fn set(
        &self,
        key: &str,
        state: &WindowState,
        ttl: RecordTtl,
    ) -> Result<(), StoreError>;

    /// Count one request against `key` as a single store operation.
    ///
    /// Stores that can run the read-modify-write atomically override this.
    /// The default goes through `get` and `set` and gives no such guarantee.
    async fn hit(
        &self,
        key: &str,
        policy: &WindowPolicy,
        now_ms: u64,
    ) -> Result<Hit, StoreError> {
        two_step_hit(self, key, policy, now_ms).await
    }
}

/// Count one request with a separate read and write.
///
/// Only admitted hits are written back.
pub async fn two_step_hit<S: WindowStore + ?Sized>(
    store: &S,
    key: &str,
    policy: &WindowPolicy,
    now_ms: u64,
) -> Result<Hit, StoreError> {
    let prior = store.get(key).await?;
    let hit = policy.count(prior, now_ms);

    if hit.admitted {
        store
            .set(key, &hit.state, policy.write_ttl(&hit, now_ms))
            .await?;
    }

    Ok(hit)
}
