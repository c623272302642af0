//! Big segments: segments whose membership lives in an external store.
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::Engine;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Segment membership of one context: segment reference (`<key>.g<generation>`) to whether the
/// context is included (`true`) or excluded (`false`).
pub type Membership = HashMap<String, bool>;

/// Metadata describing freshness of a big segment store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// Unix timestamp in milliseconds of the last time the store was fully synchronized.
    pub last_up_to_date: Option<i64>,
}

/// Capability to query an external big segment store.
#[async_trait]
pub trait BigSegmentStore: Send + Sync {
    async fn metadata(&self) -> Result<BigSegmentStoreMetadata>;

    /// Query membership for a hashed context key. `Ok(None)` means the context is not present in
    /// any big segment.
    async fn membership(&self, context_hash: &str) -> Result<Option<Membership>>;
}

/// Status of a big segment query, reported in evaluation reasons.
///
/// Variants are ordered by precedence: when an evaluation consults several big segments, the
/// highest status is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    StoreError,
    NotConfigured,
}

/// Availability of the big segment store as seen by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// Big segments settings.
#[derive(Clone)]
pub struct BigSegmentsConfig {
    pub(crate) store: Option<Arc<dyn BigSegmentStore>>,
    pub(crate) context_cache_size: usize,
    pub(crate) context_cache_time: Duration,
    pub(crate) status_poll_interval: Duration,
    pub(crate) stale_after: Duration,
}

impl BigSegmentsConfig {
    pub const DEFAULT_CONTEXT_CACHE_SIZE: usize = 1000;
    pub const DEFAULT_CONTEXT_CACHE_TIME: Duration = Duration::from_secs(5);
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

    pub fn new(store: Arc<dyn BigSegmentStore>) -> BigSegmentsConfig {
        BigSegmentsConfig {
            store: Some(store),
            ..BigSegmentsConfig::default()
        }
    }

    /// Maximum number of contexts whose membership is cached.
    pub fn context_cache_size(mut self, size: usize) -> Self {
        self.context_cache_size = size;
        self
    }

    /// How long cached membership stays valid.
    pub fn context_cache_time(mut self, time: Duration) -> Self {
        self.context_cache_time = time;
        self
    }

    pub fn status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Store is considered stale when it has not been updated for this long.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        BigSegmentsConfig {
            store: None,
            context_cache_size: Self::DEFAULT_CONTEXT_CACHE_SIZE,
            context_cache_time: Self::DEFAULT_CONTEXT_CACHE_TIME,
            status_poll_interval: Self::DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: Self::DEFAULT_STALE_AFTER,
        }
    }
}

impl std::fmt::Debug for BigSegmentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSegmentsConfig")
            .field("store", &self.store.is_some())
            .field("context_cache_size", &self.context_cache_size)
            .field("context_cache_time", &self.context_cache_time)
            .field("status_poll_interval", &self.status_poll_interval)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

/// Front-end for the big segment store: caches membership per context and tracks store
/// freshness.
pub struct BigSegmentsManager {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    cache: Mutex<LruCache<String, (Option<Arc<Membership>>, Instant)>>,
    status: Mutex<Option<(BigSegmentStoreStatus, Instant)>>,
}

impl BigSegmentsManager {
    /// Returns `None` when the config has no store.
    pub fn new(config: BigSegmentsConfig) -> Option<BigSegmentsManager> {
        let store = config.store.clone()?;
        let capacity = NonZeroUsize::new(config.context_cache_size).unwrap_or(NonZeroUsize::MIN);
        Some(BigSegmentsManager {
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            status: Mutex::new(None),
        })
    }

    /// Look up membership of a context key. The returned status is `StoreError` if the store
    /// query failed, `Stale` if the store has not been updated recently.
    pub async fn context_membership(
        &self,
        context_key: &str,
    ) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        let cached = {
            let mut cache = self.cache.lock().expect("thread holding cache lock should not panic");
            match cache.get(context_key) {
                Some((membership, at)) if at.elapsed() < self.config.context_cache_time => {
                    Some(membership.clone())
                }
                _ => None,
            }
        };

        let membership = match cached {
            Some(membership) => membership,
            None => {
                let hash = hash_for_context_key(context_key);
                match self.store.membership(&hash).await {
                    Ok(membership) => {
                        let membership = membership.map(Arc::new);
                        self.cache
                            .lock()
                            .expect("thread holding cache lock should not panic")
                            .put(context_key.to_owned(), (membership.clone(), Instant::now()));
                        membership
                    }
                    Err(err) => {
                        log::warn!(target: "flagpole",
                                   "big segment store membership query failed: {err}");
                        return (None, BigSegmentsStatus::StoreError);
                    }
                }
            }
        };

        let store_status = self.status().await;
        let status = if !store_status.available {
            BigSegmentsStatus::StoreError
        } else if store_status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        };
        (membership, status)
    }

    /// Current store status. Metadata is re-queried at most once per status poll interval.
    pub async fn status(&self) -> BigSegmentStoreStatus {
        let cached = *self
            .status
            .lock()
            .expect("thread holding status lock should not panic");
        if let Some((status, at)) = cached {
            if at.elapsed() < self.config.status_poll_interval {
                return status;
            }
        }

        let status = match self.store.metadata().await {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(err) => {
                log::warn!(target: "flagpole", "big segment store metadata query failed: {err}");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        *self
            .status
            .lock()
            .expect("thread holding status lock should not panic") = Some((status, Instant::now()));
        status
    }

    fn is_stale(&self, last_up_to_date: Option<i64>) -> bool {
        let Some(last) = last_up_to_date else {
            return true;
        };
        let age = chrono::Utc::now().timestamp_millis() - last;
        age >= self.config.stale_after.as_millis() as i64
    }
}

/// Key under which a context's membership is stored: base64 of the SHA-256 of the context key.
pub(crate) fn hash_for_context_key(context_key: &str) -> String {
    let digest = Sha256::digest(context_key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Membership reference for a segment generation.
pub(crate) fn segment_ref(segment_key: &str, generation: u64) -> String {
    format!("{segment_key}.g{generation}")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;

    use super::{
        hash_for_context_key, BigSegmentStore, BigSegmentStoreMetadata, BigSegmentsConfig,
        BigSegmentsManager, BigSegmentsStatus, Membership,
    };
    use crate::{Error, Result};

    /// In-memory big segment store keyed by unhashed context key.
    #[derive(Default)]
    pub(crate) struct MockBigSegmentStore {
        pub memberships: HashMap<String, Membership>,
        pub last_up_to_date: Option<i64>,
        pub fail: bool,
        pub queries: AtomicUsize,
    }

    impl MockBigSegmentStore {
        pub fn fresh() -> MockBigSegmentStore {
            MockBigSegmentStore {
                last_up_to_date: Some(chrono::Utc::now().timestamp_millis()),
                ..Default::default()
            }
        }

        pub fn with_membership(mut self, context_key: &str, segment_ref: &str, included: bool) -> Self {
            self.memberships
                .entry(hash_for_context_key(context_key))
                .or_default()
                .insert(segment_ref.to_owned(), included);
            self
        }
    }

    #[async_trait]
    impl BigSegmentStore for MockBigSegmentStore {
        async fn metadata(&self) -> Result<BigSegmentStoreMetadata> {
            Ok(BigSegmentStoreMetadata {
                last_up_to_date: self.last_up_to_date,
            })
        }

        async fn membership(&self, context_hash: &str) -> Result<Option<Membership>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::BigSegmentStore("unavailable".into()));
            }
            Ok(self.memberships.get(context_hash).cloned())
        }
    }

    #[test]
    fn context_hash_is_base64_sha256() {
        assert_eq!(
            hash_for_context_key("userkey"),
            "72cBpXPyn4N6TqqlS8Tti37jEcoNhFzL9ZdG1jXkILE="
        );
    }

    #[tokio::test]
    async fn membership_is_cached() {
        let store = Arc::new(MockBigSegmentStore::fresh().with_membership("u", "s.g1", true));
        let manager = BigSegmentsManager::new(BigSegmentsConfig::new(store.clone())).unwrap();

        let (membership, status) = manager.context_membership("u").await;
        assert_eq!(status, BigSegmentsStatus::Healthy);
        assert_eq!(membership.unwrap().get("s.g1"), Some(&true));
        let _ = manager.context_membership("u").await;
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_store() {
        let store = Arc::new(MockBigSegmentStore {
            last_up_to_date: Some(0),
            ..Default::default()
        });
        let manager = BigSegmentsManager::new(BigSegmentsConfig::new(store)).unwrap();
        let (membership, status) = manager.context_membership("u").await;
        assert!(membership.is_none());
        assert_eq!(status, BigSegmentsStatus::Stale);
        assert!(manager.status().await.stale);
    }

    #[tokio::test]
    async fn store_error() {
        let store = Arc::new(MockBigSegmentStore {
            fail: true,
            ..MockBigSegmentStore::fresh()
        });
        let manager = BigSegmentsManager::new(BigSegmentsConfig::new(store)).unwrap();
        let (_, status) = manager.context_membership("u").await;
        assert_eq!(status, BigSegmentsStatus::StoreError);
    }

    #[test]
    fn status_precedence() {
        assert!(BigSegmentsStatus::NotConfigured > BigSegmentsStatus::StoreError);
        assert!(BigSegmentsStatus::StoreError > BigSegmentsStatus::Stale);
        assert!(BigSegmentsStatus::Stale > BigSegmentsStatus::Healthy);
    }

    #[test]
    fn manager_requires_store() {
        assert!(BigSegmentsManager::new(BigSegmentsConfig::default()).is_none());
    }
}
