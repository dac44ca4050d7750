//! Symbolic lookup of authenticator capabilities.
//!
//! A host exposes a map from [`ComponentId`] to [`Capability`]. Builders
//! resolve the ids named in settings exactly once, at construction time;
//! nothing is looked up per request.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::auth::{ClientAuthenticator, ServerAuthenticator};
use crate::error::{InvalidComponentId, ResolveError};

/// Identifier of a pluggable component, written `type` or `type/name`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    kind: String,
    name: Option<String>,
}

impl ComponentId {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
        }
    }

    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: Some(name.into()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{name}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ComponentId {
    type Err = InvalidComponentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidComponentId {
            raw: s.to_owned(),
            reason,
        };
        let (kind, name) = match s.trim().split_once('/') {
            Some((kind, name)) => (kind, Some(name)),
            None => (s.trim(), None),
        };
        if kind.is_empty() {
            return Err(invalid("type must not be empty"));
        }
        if !kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid("type may contain only letters, digits and '_'"));
        }
        match name {
            Some("") => Err(invalid("name must not be empty when '/' is present")),
            Some(name) => Ok(Self::with_name(kind, name)),
            None => Ok(Self::new(kind)),
        }
    }
}

impl Serialize for ComponentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A component registered with a host. It may act as a client
/// authenticator, a server authenticator, or both.
#[derive(Clone, Default)]
pub struct Capability {
    client: Option<Arc<dyn ClientAuthenticator>>,
    server: Option<Arc<dyn ServerAuthenticator>>,
}

impl Capability {
    #[must_use]
    pub fn client(authenticator: Arc<dyn ClientAuthenticator>) -> Self {
        Self::default().with_client(authenticator)
    }

    #[must_use]
    pub fn server(authenticator: Arc<dyn ServerAuthenticator>) -> Self {
        Self::default().with_server(authenticator)
    }

    #[must_use]
    pub fn with_client(mut self, authenticator: Arc<dyn ClientAuthenticator>) -> Self {
        self.client = Some(authenticator);
        self
    }

    #[must_use]
    pub fn with_server(mut self, authenticator: Arc<dyn ServerAuthenticator>) -> Self {
        self.server = Some(authenticator);
        self
    }

    #[must_use]
    pub fn client_authenticator(&self) -> Option<&Arc<dyn ClientAuthenticator>> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn server_authenticator(&self) -> Option<&Arc<dyn ServerAuthenticator>> {
        self.server.as_ref()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

/// Source of capabilities consulted by the client and server builders.
pub trait CapabilityHost: Send + Sync {
    /// All registered capabilities, or `None` when the host has no registry.
    fn capabilities(&self) -> Option<&HashMap<ComponentId, Capability>>;
}

/// In-memory capability host.
#[derive(Clone, Default, Debug)]
pub struct Capabilities {
    map: HashMap<ComponentId, Capability>,
}

impl Capabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `capability` under `id`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, id: ComponentId, capability: Capability) -> Self {
        self.insert(id, capability);
        self
    }

    pub fn insert(&mut self, id: ComponentId, capability: Capability) {
        if self.map.insert(id.clone(), capability).is_some() {
            tracing::debug!(%id, "replaced registered capability");
        }
    }
}

impl CapabilityHost for Capabilities {
    fn capabilities(&self) -> Option<&HashMap<ComponentId, Capability>> {
        Some(&self.map)
    }
}

/// Host without any capability registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHost;

impl CapabilityHost for NopHost {
    fn capabilities(&self) -> Option<&HashMap<ComponentId, Capability>> {
        None
    }
}

/// Looks `id` up in `host`.
///
/// # Errors
/// [`ResolveError::NotFound`] when there is no host, the host has no
/// registry, or nothing is registered under `id`.
pub fn resolve<'a>(
    host: Option<&'a dyn CapabilityHost>,
    id: &ComponentId,
) -> Result<&'a Capability, ResolveError> {
    host.and_then(CapabilityHost::capabilities)
        .and_then(|map| map.get(id))
        .ok_or_else(|| ResolveError::NotFound(id.clone()))
}

/// Resolves `id` and requires it to be a client authenticator.
///
/// # Errors
/// See [`resolve`]; additionally [`ResolveError::NotClientAuthenticator`].
pub fn resolve_client_authenticator(
    host: Option<&dyn CapabilityHost>,
    id: &ComponentId,
) -> Result<Arc<dyn ClientAuthenticator>, ResolveError> {
    resolve(host, id)?
        .client_authenticator()
        .cloned()
        .ok_or_else(|| ResolveError::NotClientAuthenticator(id.clone()))
}

/// Resolves `id` and requires it to be a server authenticator.
///
/// # Errors
/// See [`resolve`]; additionally [`ResolveError::NotServerAuthenticator`].
pub fn resolve_server_authenticator(
    host: Option<&dyn CapabilityHost>,
    id: &ComponentId,
) -> Result<Arc<dyn ServerAuthenticator>, ResolveError> {
    resolve(host, id)?
        .server_authenticator()
        .cloned()
        .ok_or_else(|| ResolveError::NotServerAuthenticator(id.clone()))
}
