use crate::env::EnvironmentContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// An opaque token authorizing requests against one environment.
///
/// Tagged by the kind of traffic it authenticates: server-side SDKs carry an
/// SDK key, mobile SDKs a mobile key, and browser clients address the
/// environment directly by its ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Credential {
    SdkKey(String),
    MobileKey(String),
    EnvironmentId(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    SdkKey,
    MobileKey,
    EnvironmentId,
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::SdkKey(_) => CredentialKind::SdkKey,
            Credential::MobileKey(_) => CredentialKind::MobileKey,
            Credential::EnvironmentId(_) => CredentialKind::EnvironmentId,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Credential::SdkKey(v) | Credential::MobileKey(v) | Credential::EnvironmentId(v) => v,
        }
    }

    /// How this credential is rendered in an outgoing Authorization header.
    /// Environment IDs travel in the URL, never in a header.
    pub fn authorization_header(&self) -> Option<&str> {
        match self {
            Credential::SdkKey(v) | Credential::MobileKey(v) => Some(v),
            Credential::EnvironmentId(_) => None,
        }
    }

    /// Safe-to-log rendering of the credential value.
    pub fn obscured(&self) -> String {
        obscure_key(self.value())
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            CredentialKind::SdkKey => write!(f, "SDK key {}", self.obscured()),
            CredentialKind::MobileKey => write!(f, "mobile key {}", self.obscured()),
            CredentialKind::EnvironmentId => write!(f, "environment ID {}", self.value()),
        }
    }
}

/// Masks the middle of a key, keeping the first 4 and last 5 characters.
/// Only hex digits are masked; short keys are returned unchanged.
pub fn obscure_key(key: &str) -> String {
    if key.len() > 8 {
        let chars: Vec<char> = key.chars().collect();
        let middle: String = chars[4..chars.len() - 5]
            .iter()
            .map(|c| if c.is_ascii_hexdigit() { '*' } else { *c })
            .collect();
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 5..].iter().collect();
        return format!("{}{}{}", head, middle, tail);
    }
    key.to_string()
}

struct DeprecatedBinding {
    environment: Weak<EnvironmentContext>,
    until: DateTime<Utc>,
}

/// Process-wide mapping from credentials to the environment they address.
///
/// Holds weak references: lookup only, never lifecycle control. Many
/// credentials may map to one environment; a credential never maps to more
/// than one (an `add` over an existing binding replaces it).
///
/// Cloning shares the underlying maps; construct one index per process (or
/// per test) and hand copies to whoever needs lookups.
#[derive(Clone)]
pub struct CredentialIndex {
    active: Arc<DashMap<Credential, Weak<EnvironmentContext>>>,
    deprecated: Arc<DashMap<Credential, DeprecatedBinding>>,
}

impl CredentialIndex {
    pub fn new() -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            deprecated: Arc::new(DashMap::new()),
        }
    }

    /// Resolves a credential to its environment, honoring deprecated
    /// bindings until their expiry.
    pub fn lookup(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        if let Some(entry) = self.active.get(credential) {
            return entry.value().upgrade();
        }
        if let Some(entry) = self.deprecated.get(credential) {
            if Utc::now() < entry.until {
                return entry.environment.upgrade();
            }
        }
        // Expired or dangling deprecated entry: clean it up on the way out
        self.deprecated
            .remove_if(credential, |_, binding| Utc::now() >= binding.until);
        None
    }

    /// Binds a credential to an environment, atomically replacing any
    /// existing binding (including a deprecated one for the same value).
    pub fn add(&self, credential: Credential, environment: &Arc<EnvironmentContext>) {
        self.deprecated.remove(&credential);
        self.active
            .insert(credential, Arc::downgrade(environment));
    }

    /// Keeps the credential resolving until `until`, then removes it. A
    /// background task performs the removal; lookups also check the deadline
    /// so expiry is effective even before the task fires.
    pub fn deprecate(&self, credential: &Credential, until: DateTime<Utc>) {
        let environment = match self.active.remove(credential) {
            Some((_, env)) => env,
            None => return,
        };
        warn!(
            credential = %credential,
            until = %until,
            "Credential deprecated; it will stop working at the expiry time"
        );
        self.deprecated.insert(
            credential.clone(),
            DeprecatedBinding {
                environment,
                until,
            },
        );

        let deprecated = Arc::clone(&self.deprecated);
        let credential = credential.clone();
        tokio::spawn(async move {
            let delay = (until - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if deprecated
                .remove_if(&credential, |_, binding| binding.until == until)
                .is_some()
            {
                warn!(credential = %credential, "Deprecated credential has expired");
            }
        });
    }

    /// Removes a credential immediately, whether active or deprecated.
    pub fn remove(&self, credential: &Credential) {
        if self.active.remove(credential).is_some() {
            debug!(credential = %credential, "Credential removed");
        }
        self.deprecated.remove(credential);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Default for CredentialIndex {
    fn default() -> Self {
        Self::new()
    }
}
