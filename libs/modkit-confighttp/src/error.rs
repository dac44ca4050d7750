use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capability::ComponentId;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Construction-time failure of a client, server or listener.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to load TLS config: {0}")]
    Tls(#[from] TlsError),

    #[error("invalid proxy URL {url:?}: {source}")]
    InvalidProxyUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported proxy scheme {0:?}: only http proxies are supported")]
    UnsupportedProxyScheme(String),

    #[error("custom transport hook failed: {0}")]
    CustomTransport(#[source] BoxError),

    #[error("failed to resolve authenticator \"{id}\": {source}")]
    AuthResolution {
        id: ComponentId,
        #[source]
        source: ResolveError,
    },

    #[error("authenticator \"{id}\" failed to wrap the transport: {source}")]
    AuthWrap {
        id: ComponentId,
        #[source]
        source: AuthError,
    },

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("unsupported compression type {0:?}")]
    UnsupportedCompression(String),

    #[error("invalid CORS origin pattern {0:?}: at most one '*' is allowed")]
    InvalidCors(String),

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

/// Capability lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    #[error("authenticator not found")]
    NotFound(ComponentId),

    #[error("requested authenticator is not a client authenticator")]
    NotClientAuthenticator(ComponentId),

    #[error("requested authenticator is not a server authenticator")]
    NotServerAuthenticator(ComponentId),
}

/// TLS material loading or TLS context assembly failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TlsError {
    #[error("certificate and key required together")]
    CertKeyMismatch,

    #[error("server TLS requires a certificate and key")]
    MissingServerCertificate,

    #[error("failed to load certificates from {path:?}: {source}")]
    Certificates {
        path: PathBuf,
        #[source]
        source: rustls_pki_types::pem::Error,
    },

    #[error("failed to load private key from {path:?}: {source}")]
    PrivateKey {
        path: PathBuf,
        #[source]
        source: rustls_pki_types::pem::Error,
    },

    #[error("no usable CA certificates in {0:?}")]
    EmptyCaPool(PathBuf),

    #[error("client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Failure reported by an authenticator capability.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Other(BoxError),
}

/// Per-request client failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to compress request body with {encoding}: {source}")]
    Compression {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("invalid request URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
}

/// Malformed component identifier text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid component id {raw:?}: {reason}")]
pub struct InvalidComponentId {
    pub raw: String,
    pub reason: &'static str,
}
