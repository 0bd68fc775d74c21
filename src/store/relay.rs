use crate::store::{DataKind, DataSet, FeatureStore, ItemDescriptor, StoreError};
use crate::stream::{Channel, EnvStreams, StreamEvent};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Write-through wrapper around a backing store that publishes every applied
/// mutation to its environment's fan-out channels.
///
/// The hub is a non-owning handle: the owning environment constructs the hub
/// first, then this store, and tears them down in reverse, so the hub always
/// outlives the store's publish calls.
pub struct RelayFeatureStore {
    base: Arc<dyn FeatureStore>,
    streams: Arc<EnvStreams>,
    sequence: AtomicU64,
    // Serializes mutation + publish so events are observed in version order.
    write_lock: Mutex<()>,
}

impl RelayFeatureStore {
    pub fn new(base: Arc<dyn FeatureStore>, streams: Arc<EnvStreams>) -> Self {
        Self {
            base,
            streams,
            sequence: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn next_id(&self) -> String {
        self.sequence.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// The replay `put` payload for the `all` channel: both data kinds keyed
    /// under `data`, live items only.
    pub fn all_replay_event(&self) -> Result<StreamEvent, StoreError> {
        let flags = self.items_json(DataKind::Flags)?;
        let segments = self.items_json(DataKind::Segments)?;
        let data = json!({"path": "/", "data": {"flags": flags, "segments": segments}});
        Ok(StreamEvent::put(data.to_string()))
    }

    /// The replay `put` payload for the `flags` channel: the flags map alone.
    pub fn flags_replay_event(&self) -> Result<StreamEvent, StoreError> {
        let flags = self.items_json(DataKind::Flags)?;
        Ok(StreamEvent::put(flags.to_string()))
    }

    fn items_json(&self, kind: DataKind) -> Result<serde_json::Value, StoreError> {
        let mut map = serde_json::Map::new();
        for (key, desc) in self.base.get_all(kind)? {
            if let Some(item) = desc.item {
                map.insert(key, item.to_json());
            }
        }
        Ok(serde_json::Value::Object(map))
    }

    fn publish_init(&self) {
        let id = self.next_id();
        if let Ok(event) = self.all_replay_event() {
            self.streams.publish(Channel::All, event.with_id(id.clone()));
        }
        if let Ok(event) = self.flags_replay_event() {
            self.streams
                .publish(Channel::Flags, event.with_id(id.clone()));
        }
        self.streams.publish(Channel::Ping, StreamEvent::ping().with_id(id));
    }

    fn publish_upsert(&self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let id = self.next_id();
        match &item.item {
            None => {
                let all = json!({"path": format!("/{}/{}", kind.name(), key), "version": item.version});
                self.streams
                    .publish(Channel::All, StreamEvent::delete(all.to_string()).with_id(id.clone()));
                if kind == DataKind::Flags {
                    let flags = json!({"path": format!("/{}", key), "version": item.version});
                    self.streams.publish(
                        Channel::Flags,
                        StreamEvent::delete(flags.to_string()).with_id(id.clone()),
                    );
                }
            }
            Some(store_item) => {
                let item_json = store_item.to_json();
                let all = json!({"path": format!("/{}/{}", kind.name(), key), "data": item_json});
                self.streams
                    .publish(Channel::All, StreamEvent::patch(all.to_string()).with_id(id.clone()));
                if kind == DataKind::Flags {
                    let flags = json!({"path": format!("/{}", key), "data": item_json});
                    self.streams.publish(
                        Channel::Flags,
                        StreamEvent::patch(flags.to_string()).with_id(id.clone()),
                    );
                }
            }
        }
        self.streams.publish(Channel::Ping, StreamEvent::ping().with_id(id));
    }
}

impl FeatureStore for RelayFeatureStore {
    fn init(&self, data: DataSet) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        self.base.init(data)?;
        self.publish_init();
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        self.base.get(kind, key)
    }

    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, StoreError> {
        self.base.get_all(kind)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        let applied = self.base.upsert(kind, key, item.clone())?;
        // A stale write (same or lower version) publishes nothing.
        if applied {
            self.publish_upsert(kind, key, &item);
        }
        Ok(applied)
    }

    fn is_initialized(&self) -> bool {
        self.base.is_initialized()
    }
}
