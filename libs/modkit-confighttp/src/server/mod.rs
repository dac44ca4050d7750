//! Inbound HTTP pipeline: settings, builder options and the running server.

mod listener;
mod middleware;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::Authentication;
use crate::capability::{CapabilityHost, resolve_server_authenticator};
use crate::client_info::client_info_middleware;
use crate::compression::{CodecRegistry, DecodeFn};
use crate::cors::{CorsPolicy, CorsSettings, cors_middleware};
use crate::error::ConfigError;
use crate::opaque::OpaqueString;
use crate::tls::TlsServerSettings;

pub use listener::ServerListener;

pub const DEFAULT_MAX_REQUEST_BODY_SIZE: usize = 20 * 1024 * 1024;

/// Declarative settings of an inbound HTTP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// `host:port` to listen on; `:port` listens on every interface.
    pub endpoint: String,
    /// Absent means plaintext.
    pub tls: Option<TlsServerSettings>,
    pub cors: Option<CorsSettings>,
    pub auth: Option<Authentication>,
    /// Limit for raw and decoded request bodies; 0 selects the default.
    pub max_request_body_size: usize,
    /// Copy request headers into [`crate::ClientInfo::metadata`].
    pub include_metadata: bool,
    /// Headers set on every response.
    pub response_headers: HashMap<String, OpaqueString>,
    #[serde(with = "crate::humantime_serde::option")]
    pub read_header_timeout: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            endpoint: "localhost:0".to_owned(),
            tls: None,
            cors: None,
            auth: None,
            max_request_body_size: 0,
            include_metadata: false,
            response_headers: HashMap::new(),
            read_header_timeout: None,
        }
    }
}

/// Writes the response for every error the pipeline produces.
pub type ErrorHandler = Arc<dyn Fn(&Parts, &str, StatusCode) -> Response + Send + Sync>;

/// Plain-text body with the message and the given status.
pub fn default_error_handler(_parts: &Parts, message: &str, status: StatusCode) -> Response {
    (
        status,
        [
            (CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        ],
        format!("{message}\n"),
    )
        .into_response()
}

/// Per-instance hooks that cannot be expressed in serialized settings.
#[derive(Clone, Default)]
pub struct ServerOptions {
    error_handler: Option<ErrorHandler>,
    decoders: HashMap<String, DecodeFn>,
}

impl ServerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&Parts, &str, StatusCode) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Registers a request body decoder for `token`, taking precedence over
    /// the built-in codec of the same name.
    #[must_use]
    pub fn with_decoder(
        mut self,
        token: impl Into<String>,
        decoder: impl Fn(&[u8], usize) -> io::Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.decoders.insert(token.into(), Arc::new(decoder));
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut decoders: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        decoders.sort_unstable();
        f.debug_struct("ServerOptions")
            .field("custom_error_handler", &self.error_handler.is_some())
            .field("decoders", &decoders)
            .finish()
    }
}

fn is_loopback_endpoint(endpoint: &str) -> bool {
    let host = endpoint
        .rsplit_once(':')
        .map_or(endpoint, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn response_header_layers(
    headers: &HashMap<String, OpaqueString>,
) -> Result<Vec<(HeaderName, HeaderValue)>, ConfigError> {
    headers
        .iter()
        .map(|(name, value)| {
            let invalid = |reason: String| ConfigError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header =
                HeaderName::try_from(name.as_str()).map_err(|e| invalid(e.to_string()))?;
            let value = HeaderValue::from_str(value.expose()).map_err(|e| invalid(e.to_string()))?;
            Ok((header, value))
        })
        .collect()
}

impl ServerSettings {
    fn max_body(&self) -> usize {
        if self.max_request_body_size == 0 {
            DEFAULT_MAX_REQUEST_BODY_SIZE
        } else {
            self.max_request_body_size
        }
    }

    /// Wraps `handler` with the server middleware chain.
    ///
    /// Layers, outermost first: tracing, body limit, decompression, CORS,
    /// authentication, response headers, client info.
    ///
    /// # Errors
    /// Fails when the authenticator cannot be resolved, the CORS policy is
    /// malformed or a response header is not valid HTTP.
    pub fn to_server(
        &self,
        host: &dyn CapabilityHost,
        handler: Router,
        options: ServerOptions,
    ) -> Result<HttpServer, ConfigError> {
        self.to_server_with_codecs(host, handler, options, CodecRegistry::default())
    }

    /// Like [`Self::to_server`] with an explicit built-in codec registry.
    ///
    /// # Errors
    /// Same as [`Self::to_server`].
    pub fn to_server_with_codecs(
        &self,
        host: &dyn CapabilityHost,
        handler: Router,
        options: ServerOptions,
        codecs: CodecRegistry,
    ) -> Result<HttpServer, ConfigError> {
        if self.auth.is_none() && !is_loopback_endpoint(&self.endpoint) {
            tracing::warn!(
                endpoint = %self.endpoint,
                "server is reachable beyond loopback without authentication"
            );
        }

        let authenticator = self
            .auth
            .as_ref()
            .map(|auth| {
                resolve_server_authenticator(Some(host), &auth.authenticator).map_err(|source| {
                    ConfigError::AuthResolution {
                        id: auth.authenticator.clone(),
                        source,
                    }
                })
            })
            .transpose()?;
        let cors = self
            .cors
            .as_ref()
            .map(CorsPolicy::from_settings)
            .transpose()?
            .flatten();
        let response_headers = response_header_layers(&self.response_headers)?;

        let error_handler = options
            .error_handler
            .unwrap_or_else(|| -> ErrorHandler { Arc::new(default_error_handler) });
        let max_body = self.max_body();

        let mut router = handler.layer(axum::middleware::from_fn_with_state(
            self.include_metadata,
            client_info_middleware,
        ));
        for (name, value) in response_headers {
            router = router.layer(SetResponseHeaderLayer::overriding(name, value));
        }
        if let Some(authenticator) = authenticator {
            router = router.layer(axum::middleware::from_fn_with_state(
                middleware::AuthState {
                    authenticator,
                    error_handler: Arc::clone(&error_handler),
                },
                middleware::auth_middleware,
            ));
        }
        if let Some(policy) = cors {
            router = router.layer(axum::middleware::from_fn_with_state(
                Arc::new(policy),
                cors_middleware,
            ));
        }
        let router = router
            .layer(axum::middleware::from_fn_with_state(
                middleware::DecodeState {
                    custom: Arc::new(options.decoders),
                    registry: Arc::new(codecs),
                    max_body,
                    error_handler,
                },
                middleware::decompress_middleware,
            ))
            .layer(DefaultBodyLimit::max(max_body))
            .layer(TraceLayer::new_for_http());

        tracing::debug!(
            endpoint = %self.endpoint,
            tls = self.tls.is_some(),
            auth = self.auth.is_some(),
            max_body,
            "HTTP server pipeline built"
        );
        Ok(HttpServer {
            router,
            read_header_timeout: self.read_header_timeout,
        })
    }
}

/// Fully assembled server pipeline.
#[derive(Clone)]
pub struct HttpServer {
    router: Router,
    read_header_timeout: Option<Duration>,
}

impl HttpServer {
    /// The assembled router, usable with `tower::ServiceExt::oneshot` or any
    /// axum-compatible server.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serves until the process stops.
    ///
    /// # Errors
    /// Returns an error when the listener cannot be registered with tokio.
    pub async fn serve(self, listener: ServerListener) -> io::Result<()> {
        self.serve_with_shutdown(listener, CancellationToken::new())
            .await
    }

    /// Serves until `shutdown` is cancelled, then waits for open
    /// connections to finish their in-flight requests.
    ///
    /// # Errors
    /// Returns an error when the listener cannot be registered with tokio.
    pub async fn serve_with_shutdown(
        self,
        listener: ServerListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        listener::serve(self.router, listener, self.read_header_timeout, shutdown).await
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("read_header_timeout", &self.read_header_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::capability::NopHost;
    use tracing_test::traced_test;

    fn settings(endpoint: &str) -> ServerSettings {
        ServerSettings {
            endpoint: endpoint.to_owned(),
            ..ServerSettings::default()
        }
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_endpoint("localhost:8080"));
        assert!(is_loopback_endpoint("127.0.0.1:0"));
        assert!(is_loopback_endpoint("[::1]:443"));
        assert!(!is_loopback_endpoint("0.0.0.0:0"));
        assert!(!is_loopback_endpoint(":4318"));
        assert!(!is_loopback_endpoint("collector.internal:4318"));
    }

    #[test]
    #[traced_test]
    fn wildcard_endpoint_without_auth_warns_once() {
        settings("0.0.0.0:0")
            .to_server(&NopHost, Router::new(), ServerOptions::new())
            .unwrap();
        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains("without authentication"))
                .count();
            if warnings == 1 {
                Ok(())
            } else {
                Err(format!("expected 1 warning, got {warnings}"))
            }
        });
    }

    #[test]
    #[traced_test]
    fn loopback_endpoint_without_auth_does_not_warn() {
        settings("127.0.0.1:0")
            .to_server(&NopHost, Router::new(), ServerOptions::new())
            .unwrap();
        assert!(!logs_contain("without authentication"));
    }

    #[test]
    fn zero_body_limit_uses_default() {
        assert_eq!(settings("").max_body(), DEFAULT_MAX_REQUEST_BODY_SIZE);
        let custom = ServerSettings {
            max_request_body_size: 1024,
            ..ServerSettings::default()
        };
        assert_eq!(custom.max_body(), 1024);
    }

    #[test]
    fn invalid_response_header_fails_construction() {
        let mut s = settings("127.0.0.1:0");
        s.response_headers
            .insert("bad header".to_owned(), OpaqueString::from("x"));
        let err = s
            .to_server(&NopHost, Router::new(), ServerOptions::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader { .. }));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let s: ServerSettings = serde_json::from_value(serde_json::json!({
            "endpoint": ":4318",
            "include_metadata": true,
            "read_header_timeout": "5s",
            "response_headers": { "x-served-by": "collector" }
        }))
        .unwrap();
        assert!(s.include_metadata);
        assert_eq!(s.read_header_timeout, Some(Duration::from_secs(5)));
        assert_eq!(s.response_headers["x-served-by"].expose(), "collector");
        assert!(s.tls.is_none());
    }

    #[test]
    fn options_debug_lists_decoders() {
        let options = ServerOptions::new()
            .with_decoder("b", |body: &[u8], _limit: usize| Ok(body.to_vec()))
            .with_decoder("a", |body: &[u8], _limit: usize| Ok(body.to_vec()));
        assert_eq!(
            format!("{options:?}"),
            r#"ServerOptions { custom_error_handler: false, decoders: ["a", "b"] }"#
        );
    }
}
