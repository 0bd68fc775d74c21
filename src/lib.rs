// Configuration
pub mod config;

// Credentials and the process-wide credential index
pub mod credential;

// Flag, segment, and user data model
pub mod flags;

// Flag evaluation
pub mod eval;

// Feature store and write-through relay store
pub mod store;

// SSE fan-out hub
pub mod stream;

// Environment contexts and registry
pub mod env;

// Analytics event forwarding
pub mod events;

// Auto-configuration stream subscriber
pub mod autoconfig;

// HTTP API
pub mod api;

pub use credential::{Credential, CredentialIndex};
pub use env::{EnvironmentContext, EnvironmentParams, EnvironmentRegistry};
pub use store::{FeatureStore, InMemoryFeatureStore, RelayFeatureStore};
pub use stream::{Channel, EnvStreams, StreamEvent};
