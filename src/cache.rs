//! Bounded-staleness cache over a "list everything" source
//!
//! The cache holds one immutable snapshot of the whole source, keyed by
//! identifier. A snapshot younger than the TTL is served without I/O. Once it
//! expires, the next lookup triggers a full refresh; concurrent lookups during
//! that refresh wait for it and observe the same outcome.
//!
//! A failed refresh keeps the previous snapshot and its timestamp, so the next
//! lookup retries immediately. Callers get [`CacheError::Fetch`] with the
//! retained record attached instead of a silent stale answer.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::{record_cache_refresh, RefreshResult};
use crate::Error;

/// Default time a snapshot is served before it is refreshed (30 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Source that can list all entries in one call
#[async_trait]
pub trait FetchAll<K, V>: Send + Sync {
    /// Fetch every entry, keyed by identifier
    async fn fetch_all(&self) -> Result<HashMap<K, V>, Error>;
}

/// Lookup failure
#[derive(Debug, Clone, PartialEq)]
pub enum CacheError<V> {
    /// The identifier is absent from a fresh snapshot
    NotFound {
        /// Identifier that was looked up
        key: String,
    },
    /// The snapshot was expired and refreshing it failed
    Fetch {
        /// Refresh failure, identical for every caller that waited on it
        message: String,
        /// Entry from the retained (expired) snapshot, if it had one
        stale: Option<V>,
    },
}

impl<V> fmt::Display for CacheError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound { key } => write!(f, "{key} not found"),
            CacheError::Fetch { message, .. } => write!(f, "cache refresh failed: {message}"),
        }
    }
}

impl<V: fmt::Debug> std::error::Error for CacheError<V> {}

/// Immutable view of the source at one point in time
#[derive(Debug)]
pub struct CacheSnapshot<K, V> {
    entries: HashMap<K, V>,
    fetched_at: Option<Instant>,
}

impl<K: Eq + Hash, V> CacheSnapshot<K, V> {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            fetched_at: None,
        }
    }

    fn new(entries: HashMap<K, V>) -> Self {
        Self {
            entries,
            fetched_at: Some(Instant::now()),
        }
    }

    /// Whether the snapshot was fetched less than `ttl` ago
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }

    /// Look up a single entry
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the snapshot was fetched; `None` before the first successful refresh
    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }
}

type SnapshotRef<K, V> = Arc<CacheSnapshot<K, V>>;
type RefreshFuture<K, V> = Shared<BoxFuture<'static, Result<SnapshotRef<K, V>, String>>>;

struct Inner<K, V> {
    ttl: Duration,
    source: Arc<dyn FetchAll<K, V>>,
    current: RwLock<SnapshotRef<K, V>>,
    pending: Mutex<Option<RefreshFuture<K, V>>>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn refresh(self: Arc<Self>) -> Result<SnapshotRef<K, V>, String> {
        debug!("refreshing cache from source");
        let outcome = match self.source.fetch_all().await {
            Ok(entries) => {
                let snapshot = Arc::new(CacheSnapshot::new(entries));
                *self.current.write() = snapshot.clone();
                info!(entries = snapshot.len(), "cache refreshed");
                record_cache_refresh(RefreshResult::Success, Some(snapshot.len()));
                Ok(snapshot)
            }
            Err(e) => {
                warn!(error = %e, "cache refresh failed, keeping previous snapshot");
                record_cache_refresh(RefreshResult::Error, None);
                Err(e.to_string())
            }
        };
        self.pending.lock().take();
        outcome
    }
}

/// Single-flight TTL cache over a [`FetchAll`] source
pub struct FetchAllCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for FetchAllCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> FetchAllCache<K, V>
where
    K: Eq + Hash + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache; the first lookup fetches
    pub fn new(ttl: Duration, source: Arc<dyn FetchAll<K, V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                source,
                current: RwLock::new(Arc::new(CacheSnapshot::empty())),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Current snapshot, fresh or not
    pub fn snapshot(&self) -> SnapshotRef<K, V> {
        self.inner.current.read().clone()
    }

    /// Look up `key`, refreshing the snapshot first if it has expired
    pub async fn get(&self, key: &K) -> Result<V, CacheError<V>> {
        let snapshot = self.snapshot();
        if snapshot.is_fresh(self.inner.ttl) {
            return lookup(&snapshot, key);
        }

        let refresh = {
            let mut pending = self.inner.pending.lock();
            // Another caller may have finished a refresh since the check above.
            let snapshot = self.snapshot();
            if snapshot.is_fresh(self.inner.ttl) {
                return lookup(&snapshot, key);
            }
            match pending.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.inner.clone().refresh().boxed().shared();
                    *pending = Some(refresh.clone());
                    refresh
                }
            }
        };

        match refresh.await {
            Ok(snapshot) => lookup(&snapshot, key),
            Err(message) => Err(CacheError::Fetch {
                message,
                stale: self.snapshot().get(key).cloned(),
            }),
        }
    }
}

fn lookup<K, V>(snapshot: &CacheSnapshot<K, V>, key: &K) -> Result<V, CacheError<V>>
where
    K: Eq + Hash + fmt::Display,
    V: Clone,
{
    snapshot
        .get(key)
        .cloned()
        .ok_or_else(|| CacheError::NotFound {
            key: key.to_string(),
        })
}
