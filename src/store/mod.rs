use crate::flags::{FeatureFlag, Segment};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

pub mod relay;
pub use relay::RelayFeatureStore;


/// The two kinds of data the relay caches per environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flags,
    Segments,
}

impl DataKind {
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Flags => "flags",
            DataKind::Segments => "segments",
        }
    }
}

/// A typed flag or segment item.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
}

impl StoreItem {
    pub fn kind(&self) -> DataKind {
        match self {
            StoreItem::Flag(_) => DataKind::Flags,
            StoreItem::Segment(_) => DataKind::Segments,
        }
    }

    /// JSON rendering used in SSE payloads and polling responses.
    pub fn to_json(&self) -> Value {
        match self {
            StoreItem::Flag(f) => serde_json::to_value(f).unwrap_or(Value::Null),
            StoreItem::Segment(s) => serde_json::to_value(s).unwrap_or(Value::Null),
        }
    }
}

/// A versioned item slot. `item: None` is a tombstone: the key was deleted
/// at the given version.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<StoreItem>,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: StoreItem) -> Self {
        Self {
            version,
            item: Some(item),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            item: None,
        }
    }
}

/// A complete data set, as delivered by an upstream `put`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataSet {
    pub flags: HashMap<String, ItemDescriptor>,
    pub segments: HashMap<String, ItemDescriptor>,
}

/// Errors reading or writing a backing store
#[derive(Debug, PartialEq)]
pub enum StoreError {
    NotInitialized,
    Backing(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotInitialized => write!(f, "feature store has not been initialized"),
            StoreError::Backing(msg) => write!(f, "feature store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Abstract key/version store holding one environment's flag and segment data.
///
/// Upserts are monotonic per key: a write whose version is not strictly
/// greater than the stored version (live item or tombstone) is not applied.
/// `init` replaces the entire contents atomically.
pub trait FeatureStore: Send + Sync {
    fn init(&self, data: DataSet) -> Result<(), StoreError>;

    /// Returns the descriptor for a key, including tombstones. `None` means
    /// the key has never been seen.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError>;

    /// Returns all live (non-tombstone) items of a kind.
    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, StoreError>;

    /// Writes an item or tombstone; returns whether the write was applied.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError>;

    fn is_initialized(&self) -> bool;
}

/// The default backing store: two guarded in-memory maps.
pub struct InMemoryFeatureStore {
    flags: RwLock<HashMap<String, ItemDescriptor>>,
    segments: RwLock<HashMap<String, ItemDescriptor>>,
    initialized: AtomicBool,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            segments: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn map(&self, kind: DataKind) -> &RwLock<HashMap<String, ItemDescriptor>> {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }
}

impl Default for InMemoryFeatureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn init(&self, data: DataSet) -> Result<(), StoreError> {
        // Swap both maps before flipping the initialized bit so readers never
        // observe a half-replaced data set.
        *self.flags.write().unwrap() = data.flags;
        *self.segments.write().unwrap() = data.segments;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        Ok(self.map(kind).read().unwrap().get(key).cloned())
    }

    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, StoreError> {
        Ok(self
            .map(kind)
            .read()
            .unwrap()
            .iter()
            .filter(|(_, desc)| desc.item.is_some())
            .map(|(k, desc)| (k.clone(), desc.clone()))
            .collect())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError> {
        let mut map = self.map(kind).write().unwrap();
        match map.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                map.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}
