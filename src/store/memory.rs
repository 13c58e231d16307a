//! In-process window store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::ratelimit::{
    Clock, Hit, RecordTtl, SystemClock, WindowPolicy, WindowState, WindowStore,
};

/// A raw record with its eviction deadline.
#[derive(Debug, Clone)]
struct StoredRecord {
    /// Encoded value, exactly as a remote store would hold it
    raw: String,
    /// When the record disappears, in milliseconds since the Unix epoch
    evict_at: Option<u64>,
}

impl StoredRecord {
    fn is_live(&self, now_ms: u64) -> bool {
        self.evict_at.map_or(true, |at| now_ms < at)
    }
}

/// Eviction deadline after a write over `existing`.
fn next_evict_at(existing: Option<&StoredRecord>, ttl: RecordTtl, now_ms: u64) -> u64 {
    let kept = match ttl {
        RecordTtl::Replace(_) => None,
        RecordTtl::KeepOr(_) => existing
            .filter(|record| record.is_live(now_ms))
            .and_then(|record| record.evict_at),
    };
    kept.unwrap_or_else(|| evict_at(now_ms, ttl.duration()))
}

/// A window store held in process memory.
///
/// Records carry TTLs evaluated against the store's clock, so the store
/// behaves like a key-value server with native expiry. `hit` runs under the
/// map's per-key lock and is atomic. It judges eviction at the time it is
/// handed, the same instant it counts at.
pub struct MemoryStore {
    /// Records by storage key
    records: DashMap<String, StoredRecord>,
    /// Time source for eviction
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Store a raw value, bypassing encoding.
    pub fn put_raw(&self, key: &str, raw: impl Into<String>, ttl: Option<Duration>) {
        let now = self.clock.now_ms();
        self.records.insert(
            key.to_string(),
            StoredRecord {
                raw: raw.into(),
                evict_at: ttl.map(|ttl| evict_at(now, ttl)),
            },
        );
    }

    /// Time left before `key` is evicted.
    ///
    /// `None` when the key is missing or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_ms();
        let record = self.records.get(key)?;
        if !record.is_live(now) {
            return None;
        }
        record
            .evict_at
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.records.iter().filter(|r| r.is_live(now)).count()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record whose TTL has run out. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        before.saturating_sub(self.records.len())
    }

    /// Periodically purge expired records until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(live) = store.upgrade() else {
                    break;
                };
                let purged = live.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, "Purged expired window records");
                }
            }
        })
    }

    fn decode(key: &str, record: &StoredRecord) -> Option<WindowState> {
        let state = WindowState::decode(&record.raw);
        if state.is_none() {
            warn!(key = %key, "Malformed window record, treating as absent");
        }
        state
    }
}

fn evict_at(now_ms: u64, ttl: Duration) -> u64 {
    now_ms.saturating_add(ttl.as_millis() as u64)
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        let now = self.clock.now_ms();

        let record = self.records.get(key).map(|r| r.value().clone());

        match record {
            Some(record) if record.is_live(now) => Ok(Self::decode(key, &record)),
            Some(_) => {
                self.records.remove_if(key, |_, r| !r.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        state: &WindowState,
        ttl: RecordTtl,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let raw = state.encode();

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let evict = next_evict_at(Some(entry.get()), ttl, now);
                let record = entry.get_mut();
                record.raw = raw;
                record.evict_at = Some(evict);
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredRecord {
                    raw,
                    evict_at: Some(next_evict_at(None, ttl, now)),
                });
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
        let hit = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let live = entry.get().is_live(now_ms);
                let prior = if live {
                    Self::decode(key, entry.get())
                } else {
                    None
                };
                let hit = policy.count(prior, now_ms);

                if hit.admitted {
                    let ttl = policy.write_ttl(&hit, now_ms);
                    let evict = next_evict_at(Some(entry.get()), ttl, now_ms);
                    let record = entry.get_mut();
                    record.raw = hit.state.encode();
                    record.evict_at = Some(evict);
                } else if !live {
                    entry.remove();
                }
                hit
            }
            Entry::Vacant(entry) => {
                let hit = policy.count(None, now_ms);
                if hit.admitted {
                    let ttl = policy.write_ttl(&hit, now_ms);
                    entry.insert(StoredRecord {
                        raw: hit.state.encode(),
                        evict_at: Some(next_evict_at(None, ttl, now_ms)),
                    });
                }
                hit
            }
        };

        Ok(hit)
    }
}
