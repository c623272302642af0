//! Feature store: a thread-safe storage for flags and segments. [`FeatureStore`] is read by the
//! evaluator and written by update sources (streaming or polling) through put/patch/delete
//! notifications.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::flags::{Flag, Segment};

/// Kind of item held by a feature store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    Features,
    Segments,
}

/// Full data set delivered by a `put` notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

/// A single item delivered by a `patch` notification.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Flag(Flag),
    Segment(Segment),
}

impl StoreItem {
    fn kind(&self) -> DataKind {
        match self {
            StoreItem::Flag(_) => DataKind::Features,
            StoreItem::Segment(_) => DataKind::Segments,
        }
    }

    fn key(&self) -> &str {
        match self {
            StoreItem::Flag(flag) => &flag.key,
            StoreItem::Segment(segment) => &segment.key,
        }
    }
}

/// Capability to read and update flags and segments.
///
/// Readers never observe deleted items: tombstones are kept only to reject out-of-order updates.
pub trait FeatureStore: Send + Sync {
    fn flag(&self, key: &str) -> Option<Arc<Flag>>;

    fn segment(&self, key: &str) -> Option<Arc<Segment>>;

    fn all_flags(&self) -> HashMap<String, Arc<Flag>>;

    /// Whether the store has received a full data set.
    fn initialized(&self) -> bool;

    /// Replace all data.
    fn init(&self, data: AllData);

    /// Insert or update an item if its version is newer than the stored one. Returns `true` if
    /// the item was applied.
    fn upsert(&self, item: StoreItem) -> bool;

    /// Delete an item by storing a tombstone with the given version. Returns `true` if applied.
    fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool;

    /// Short name reported in diagnostics.
    fn description(&self) -> String {
        "memory".to_owned()
    }
}

#[derive(Default)]
struct StoreData {
    initialized: bool,
    flags: HashMap<String, Arc<Flag>>,
    segments: HashMap<String, Arc<Segment>>,
}

/// The default feature store, holding all data in memory.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    data: RwLock<StoreData>,
}

impl InMemoryFeatureStore {
    /// Create a new empty, uninitialized store.
    pub fn new() -> Self {
        InMemoryFeatureStore::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the lock),
        // which should never happen.
        self.data
            .read()
            .expect("thread holding feature store lock should not panic")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.data
            .write()
            .expect("thread holding feature store lock should not panic")
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.read().flags.get(key).filter(|f| !f.deleted).cloned()
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.read().segments.get(key).filter(|s| !s.deleted).cloned()
    }

    fn all_flags(&self) -> HashMap<String, Arc<Flag>> {
        self.read()
            .flags
            .iter()
            .filter(|(_, flag)| !flag.deleted)
            .map(|(key, flag)| (key.clone(), flag.clone()))
            .collect()
    }

    fn initialized(&self) -> bool {
        self.read().initialized
    }

    fn init(&self, data: AllData) {
        let mut store = self.write();
        store.flags = data
            .flags
            .into_iter()
            .map(|(key, flag)| (key, Arc::new(flag)))
            .collect();
        store.segments = data
            .segments
            .into_iter()
            .map(|(key, segment)| (key, Arc::new(segment)))
            .collect();
        store.initialized = true;
        log::debug!(target: "flagpole",
                    flags = store.flags.len(),
                    segments = store.segments.len();
                    "feature store initialized");
    }

    fn upsert(&self, item: StoreItem) -> bool {
        let mut store = self.write();
        let kind = item.kind();
        let key = item.key().to_owned();
        let applied = match item {
            StoreItem::Flag(flag) => {
                let newer = store.flags.get(&key).map_or(true, |old| old.version < flag.version);
                if newer {
                    store.flags.insert(key.clone(), Arc::new(flag));
                }
                newer
            }
            StoreItem::Segment(segment) => {
                let newer = store
                    .segments
                    .get(&key)
                    .map_or(true, |old| old.version < segment.version);
                if newer {
                    store.segments.insert(key.clone(), Arc::new(segment));
                }
                newer
            }
        };
        if !applied {
            log::debug!(target: "flagpole", key, kind:?; "ignoring outdated update");
        }
        applied
    }

    fn delete(&self, kind: DataKind, key: &str, version: u64) -> bool {
        match kind {
            DataKind::Features => self.upsert(StoreItem::Flag(Flag {
                key: key.to_owned(),
                version,
                deleted: true,
                ..Flag::default()
            })),
            DataKind::Segments => self.upsert(StoreItem::Segment(Segment {
                key: key.to_owned(),
                version,
                deleted: true,
                ..Segment::default()
            })),
        }
    }
}
