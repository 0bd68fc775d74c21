use crate::credential::{Credential, CredentialIndex};
use crate::events::EventDispatcher;
use crate::flags::User;
#[allow(unused_imports)]
use crate::store::{FeatureStore, InMemoryFeatureStore, RelayFeatureStore, StoreError};
use crate::stream::{Channel, EnvStreams, StreamEvent, StreamSubscription};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

pub mod datasource;
pub use datasource::{
    CapturingDataSourceFactory, DataSource, DataSourceFactory, DataSourceState, UpdateSink,
};


/// How long environment construction waits for the stub data source to hand
/// back the update sink.
pub const SINK_CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Human-readable identifiers for an environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvIdentifiers {
    pub name: String,
    pub proj_key: Option<String>,
    pub env_key: Option<String>,
}

impl EnvIdentifiers {
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match (&self.proj_key, &self.env_key) {
            (Some(p), Some(e)) => format!("{} {}", p, e),
            _ => String::new(),
        }
    }
}

/// An SDK key that remains valid until a stated deadline.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpiringSdkKey {
    pub key: String,
    pub expiry: DateTime<Utc>,
}

/// Everything needed to construct or update one environment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentParams {
    pub identifiers: EnvIdentifiers,
    pub sdk_key: Option<String>,
    pub mobile_key: Option<String>,
    pub env_id: Option<String>,
    pub expiring_sdk_key: Option<ExpiringSdkKey>,
    pub secure_mode: bool,
    pub ttl: Duration,
}

impl EnvironmentParams {
    /// The active credentials these parameters describe (the expiring key is
    /// handled separately).
    pub fn credentials(&self) -> Vec<Credential> {
        let mut credentials = Vec::new();
        if let Some(key) = &self.sdk_key {
            credentials.push(Credential::SdkKey(key.clone()));
        }
        if let Some(key) = &self.mobile_key {
            credentials.push(Credential::MobileKey(key.clone()));
        }
        if let Some(id) = &self.env_id {
            credentials.push(Credential::EnvironmentId(id.clone()));
        }
        credentials
    }

    /// The key environments are registered under: the environment ID when
    /// present, the display name otherwise.
    pub fn stable_key(&self) -> String {
        self.env_id
            .clone()
            .unwrap_or_else(|| self.identifiers.display_name())
    }
}

/// Errors constructing or using an environment
#[derive(Debug)]
pub enum EnvironmentError {
    CaptureTimeout,
    StoreRead(StoreError),
    Closed,
}

impl std::fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentError::CaptureTimeout => {
                write!(f, "timed out waiting for update sink capture")
            }
            EnvironmentError::StoreRead(e) => write!(f, "feature store read failed: {}", e),
            EnvironmentError::Closed => write!(f, "environment is closed"),
        }
    }
}

impl std::error::Error for EnvironmentError {}

/// One logical tenant of the relay.
///
/// Owns the authoritative flag/segment snapshot, the fan-out hub its
/// subscribers attach to, the captured update sink feeding the snapshot, and
/// per-environment metadata. The credential index only ever holds weak
/// references back; lifecycle stays here.
pub struct EnvironmentContext {
    identifiers: RwLock<EnvIdentifiers>,
    ttl: RwLock<Duration>,
    secure_mode: AtomicBool,
    credentials: Mutex<HashSet<Credential>>,
    index: CredentialIndex,
    streams: Arc<EnvStreams>,
    store: Arc<RelayFeatureStore>,
    sink: UpdateSink,
    dispatcher: Option<EventDispatcher>,
    source_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl EnvironmentContext {
    /// Builds the environment and captures its update sink.
    ///
    /// Construction order matters: the hub exists first, then the
    /// write-through store publishing into it, then the data source wired to
    /// the store. The factory's data source is started on its own task; if
    /// the sink does not arrive on the rendezvous channel within
    /// `SINK_CAPTURE_TIMEOUT`, construction fails and the caller must not
    /// register the environment.
    pub async fn new(
        params: EnvironmentParams,
        index: CredentialIndex,
        factory: &dyn DataSourceFactory,
        mut capture_rx: mpsc::Receiver<UpdateSink>,
        dispatcher: Option<EventDispatcher>,
        keepalive: Duration,
    ) -> Result<Arc<Self>, EnvironmentError> {
        let streams = Arc::new(EnvStreams::new(keepalive));
        let base = Arc::new(InMemoryFeatureStore::new());
        let store = Arc::new(RelayFeatureStore::new(base, Arc::clone(&streams)));
        let sink = UpdateSink::new(Arc::clone(&store));

        let mut source = factory.build(sink);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (ready_tx, _ready_rx) = oneshot::channel();
            source.start(ready_tx);
            // Keep the source alive until the environment closes
            let _ = shutdown_rx.await;
            source.close();
        });

        let captured = tokio::time::timeout(SINK_CAPTURE_TIMEOUT, capture_rx.recv())
            .await
            .ok()
            .flatten()
            .ok_or(EnvironmentError::CaptureTimeout)?;

        Ok(Arc::new(Self {
            identifiers: RwLock::new(params.identifiers),
            ttl: RwLock::new(params.ttl),
            secure_mode: AtomicBool::new(params.secure_mode),
            credentials: Mutex::new(HashSet::new()),
            index,
            streams,
            store,
            sink: captured,
            dispatcher,
            source_shutdown: Mutex::new(Some(shutdown_tx)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Read side of the flag/segment snapshot.
    pub fn store(&self) -> &Arc<RelayFeatureStore> {
        &self.store
    }

    /// The captured update sink; auto-config flows use this to push
    /// replacement snapshots without restarting the data source.
    pub fn sink(&self) -> &UpdateSink {
        &self.sink
    }

    pub fn streams(&self) -> &Arc<EnvStreams> {
        &self.streams
    }

    pub fn data_source_state(&self) -> DataSourceState {
        self.sink.state()
    }

    /// Whether the upstream client considers itself initialized.
    pub fn client_initialized(&self) -> bool {
        self.sink.state() == DataSourceState::Valid
    }

    pub fn event_dispatcher(&self) -> Option<&EventDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Attaches a subscriber to one of this environment's channels. The
    /// replay event is computed from the current snapshot before the
    /// subscriber starts observing published events.
    pub fn subscribe(&self, channel: Channel) -> Result<StreamSubscription, EnvironmentError> {
        let replay = match channel {
            Channel::All => self
                .store
                .all_replay_event()
                .map_err(EnvironmentError::StoreRead)?,
            Channel::Flags => self
                .store
                .flags_replay_event()
                .map_err(EnvironmentError::StoreRead)?,
            Channel::Ping => StreamEvent::ping(),
        };
        self.streams
            .subscribe(channel, replay)
            .map_err(|_| EnvironmentError::Closed)
    }

    pub fn add_credential(self: &Arc<Self>, credential: Credential) {
        self.credentials.lock().unwrap().insert(credential.clone());
        self.index.add(credential, self);
    }

    pub fn remove_credential(&self, credential: &Credential) {
        self.credentials.lock().unwrap().remove(credential);
        self.index.remove(credential);
    }

    /// Keeps the credential resolving until `until`, then drops it.
    pub fn deprecate_credential(&self, credential: &Credential, until: DateTime<Utc>) {
        self.credentials.lock().unwrap().remove(credential);
        self.index.deprecate(credential, until);
    }

    /// Snapshot of the active (non-deprecated) credentials.
    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.lock().unwrap().iter().cloned().collect()
    }

    pub fn sdk_key(&self) -> Option<String> {
        self.credentials
            .lock()
            .unwrap()
            .iter()
            .find_map(|c| match c {
                Credential::SdkKey(v) => Some(v.clone()),
                _ => None,
            })
    }

    pub fn identifiers(&self) -> EnvIdentifiers {
        self.identifiers.read().unwrap().clone()
    }

    pub fn set_identifiers(&self, identifiers: EnvIdentifiers) {
        *self.identifiers.write().unwrap() = identifiers;
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read().unwrap()
    }

    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write().unwrap() = ttl;
    }

    pub fn secure_mode(&self) -> bool {
        self.secure_mode.load(Ordering::SeqCst)
    }

    pub fn set_secure_mode(&self, secure_mode: bool) {
        self.secure_mode.store(secure_mode, Ordering::SeqCst)
    }

    /// The hash a browser client must present in secure mode:
    /// HMAC-SHA256 of the user key, keyed by the SDK key, in lowercase hex.
    pub fn secure_mode_hash(&self, user: &User) -> Option<String> {
        let sdk_key = self.sdk_key()?;
        let mut mac =
            Hmac::<Sha256>::new_from_slice(sdk_key.as_bytes()).expect("HMAC accepts any key size");
        mac.update(user.key().as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Disconnects all subscribers, stops the upstream source, and removes
    /// this environment's credentials from the index. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.streams.close();
        if let Some(shutdown) = self.source_shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
        for credential in self.credentials.lock().unwrap().drain() {
            self.index.remove(&credential);
        }
    }
}

/// The set of configured environments plus the process-wide credential index.
pub struct EnvironmentRegistry {
    index: CredentialIndex,
    environments: DashMap<String, Arc<EnvironmentContext>>,
    keepalive: Duration,
    event_forwarding: Option<EventForwarding>,
}

/// Where analytics events get forwarded, when the event proxy is enabled.
#[derive(Clone, Debug)]
pub struct EventForwarding {
    pub uri: String,
    pub timeout: Duration,
}

impl EnvironmentRegistry {
    pub fn new(keepalive: Duration, event_forwarding: Option<EventForwarding>) -> Self {
        Self {
            index: CredentialIndex::new(),
            environments: DashMap::new(),
            keepalive,
            event_forwarding,
        }
    }

    pub fn index(&self) -> &CredentialIndex {
        &self.index
    }

    /// Constructs and registers an environment with the standard capturing
    /// data source.
    pub async fn add_environment(
        &self,
        params: EnvironmentParams,
    ) -> Result<Arc<EnvironmentContext>, EnvironmentError> {
        let (factory, capture_rx) = CapturingDataSourceFactory::new();
        self.add_environment_with(params, &factory, capture_rx)
            .await
    }

    /// Construction with a caller-supplied data source factory (the capture
    /// rendezvous must belong to that factory).
    pub async fn add_environment_with(
        &self,
        params: EnvironmentParams,
        factory: &dyn DataSourceFactory,
        capture_rx: mpsc::Receiver<UpdateSink>,
    ) -> Result<Arc<EnvironmentContext>, EnvironmentError> {
        let dispatcher = self.event_forwarding.as_ref().map(|forwarding| {
            EventDispatcher::new(&forwarding.uri, forwarding.timeout, &params.credentials())
        });
        let key = params.stable_key();
        let display_name = params.identifiers.display_name();
        let credentials = params.credentials();
        let expiring = params.expiring_sdk_key.clone();

        let env = match EnvironmentContext::new(
            params,
            self.index.clone(),
            factory,
            capture_rx,
            dispatcher,
            self.keepalive,
        )
        .await
        {
            Ok(env) => env,
            Err(e) => {
                error!(environment = %display_name, error = %e, "Unable to initialize environment");
                return Err(e);
            }
        };

        for credential in credentials {
            env.add_credential(credential);
        }
        if let Some(expiring) = expiring {
            let credential = Credential::SdkKey(expiring.key);
            // Only honor the expiring key if nothing else owns it
            if self.index.lookup(&credential).is_none() {
                env.add_credential(credential.clone());
                env.deprecate_credential(&credential, expiring.expiry);
            }
        }

        info!(environment = %display_name, "Environment registered");
        self.environments.insert(key, Arc::clone(&env));
        Ok(env)
    }

    pub fn get(&self, key: &str) -> Option<Arc<EnvironmentContext>> {
        self.environments.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn lookup_credential(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        self.index.lookup(credential)
    }

    pub fn all(&self) -> Vec<Arc<EnvironmentContext>> {
        self.environments
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Closes and unregisters an environment. Returns whether it existed.
    pub fn remove_environment(&self, key: &str) -> bool {
        match self.environments.remove(key) {
            Some((_, env)) => {
                env.close();
                info!(environment = %env.identifiers().display_name(), "Environment removed");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for env in self.all() {
            env.close();
        }
        self.environments.clear();
    }
}
