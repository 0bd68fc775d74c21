use crate::store::{DataKind, DataSet, FeatureStore, ItemDescriptor, RelayFeatureStore};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Connection state reported by an environment's upstream data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    Initializing,
    Valid,
    Interrupted,
    Off,
}

/// The write side of an environment's data pipeline, handed to whatever is
/// driving flag data: the upstream client in normal operation, or the
/// auto-configuration flows when they push replacement snapshots.
#[derive(Clone)]
pub struct UpdateSink {
    store: Arc<RelayFeatureStore>,
    state: Arc<RwLock<DataSourceState>>,
}

impl UpdateSink {
    pub fn new(store: Arc<RelayFeatureStore>) -> Self {
        Self {
            store,
            state: Arc::new(RwLock::new(DataSourceState::Initializing)),
        }
    }

    /// Replaces the environment's entire data set. A successfully applied
    /// data set marks the source valid, so `client_initialized` holds once
    /// the first snapshot lands.
    pub fn init(&self, data: DataSet) -> bool {
        match self.store.init(data) {
            Ok(()) => {
                self.update_status(DataSourceState::Valid);
                true
            }
            Err(e) => {
                warn!(error = %e, "Data set replacement failed");
                false
            }
        }
    }

    /// Applies a single upstream mutation.
    pub fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        match self.store.upsert(kind, key, item) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, key = %key, "Upstream mutation failed");
                false
            }
        }
    }

    pub fn update_status(&self, state: DataSourceState) {
        *self.state.write().unwrap() = state;
    }

    pub fn state(&self) -> DataSourceState {
        *self.state.read().unwrap()
    }

    pub fn store(&self) -> &Arc<RelayFeatureStore> {
        &self.store
    }
}

/// An upstream data source as seen by the environment: started once, closed
/// on shutdown. Initialization is reported through the sink's state, not the
/// source itself.
pub trait DataSource: Send {
    /// Begins delivering data. `ready` is signalled when the source
    /// considers itself started.
    fn start(&mut self, ready: oneshot::Sender<()>);

    fn close(&mut self) {}
}

pub trait DataSourceFactory: Send + Sync {
    fn build(&self, sink: UpdateSink) -> Box<dyn DataSource>;
}

/// Factory wired into every environment: its stub data source does not
/// produce any data itself, it hands the environment's update sink out on a
/// rendezvous channel so the owner can both observe updates and inject
/// snapshots without restarting anything.
pub struct CapturingDataSourceFactory {
    tx: mpsc::Sender<UpdateSink>,
}

impl CapturingDataSourceFactory {
    /// Returns the factory plus the receive side of the rendezvous. The
    /// environment constructor waits on the receiver with a bounded timeout.
    pub fn new() -> (Self, mpsc::Receiver<UpdateSink>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }
}

impl DataSourceFactory for CapturingDataSourceFactory {
    fn build(&self, sink: UpdateSink) -> Box<dyn DataSource> {
        Box::new(CapturingStubDataSource {
            sink: Some(sink),
            tx: self.tx.clone(),
        })
    }
}

struct CapturingStubDataSource {
    sink: Option<UpdateSink>,
    tx: mpsc::Sender<UpdateSink>,
}

impl DataSource for CapturingStubDataSource {
    fn start(&mut self, ready: oneshot::Sender<()>) {
        if let Some(sink) = self.sink.take() {
            // Capacity-one channel created alongside this stub: never full.
            let _ = self.tx.try_send(sink);
        }
        let _ = ready.send(());
    }
}
