#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Declarative HTTP client and server construction for `ModKit`
//!
//! Settings structs describe transport behavior; builders turn them into
//! long-lived objects with a fixed middleware order:
//!
//! - Client: compression -> static headers -> authentication -> custom hook
//!   -> base transport (hyper + rustls, pooled, proxy aware)
//! - Server: trace -> body limit -> decompression -> CORS -> authentication
//!   -> response headers -> client info -> user handler
//!
//! Authenticators are pluggable capabilities resolved by [`ComponentId`]
//! from a [`CapabilityHost`] once, at construction time.
//!
//! # Example
//!
//! ```ignore
//! use modkit_confighttp::{Capabilities, ClientSettings, CompressionType};
//!
//! let settings = ClientSettings {
//!     endpoint: "https://collector.example.com".into(),
//!     compression: CompressionType::Gzip,
//!     ..ClientSettings::default()
//! };
//! let client = settings.to_client(&Capabilities::new())?;
//! let response = client.post(&settings.endpoint, "payload").await?;
//! ```

mod auth;
mod capability;
pub mod client;
mod client_info;
mod compression;
mod cors;
mod error;
mod humantime_serde;
mod opaque;
pub mod server;
mod tls;

pub use auth::{ClientAuthenticator, ServerAuthenticator, ServerAuthenticatorFn};
pub use capability::{
    Capabilities, Capability, CapabilityHost, ComponentId, NopHost, resolve,
    resolve_client_authenticator, resolve_server_authenticator,
};
pub use client::{ClientSettings, CustomTransport, HttpClient, Transport, TransportLayer};
pub use client_info::{ClientAddr, ClientInfo, Metadata};
pub use compression::{CodecRegistry, CompressionType, DecodeFn, EncodeFn};
pub use cors::CorsSettings;
pub use error::{
    AuthError, ConfigError, HttpError, InvalidComponentId, ResolveError, TlsError,
};
pub use opaque::OpaqueString;
pub use server::{
    ErrorHandler, HttpServer, ServerListener, ServerOptions, ServerSettings,
    default_error_handler,
};
pub use tls::{TlsClientSettings, TlsServerSettings};

/// Reference to the authenticator capability a client or server should use.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct Authentication {
    pub authenticator: ComponentId,
}

/// Body type accepted by every client transport layer.
pub type RequestBody = http_body_util::Full<bytes::Bytes>;

/// Type-erased response body produced by the client pipeline.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<bytes::Bytes, Box<dyn std::error::Error + Send + Sync>>;
