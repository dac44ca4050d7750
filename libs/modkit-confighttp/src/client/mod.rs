//! Outbound HTTP client built from [`ClientSettings`].
//!
//! Wrapping order, outermost first:
//! compression -> static headers -> authentication -> custom hook -> base.

mod config;
mod layers;
mod proxy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::util::BoxCloneSyncService;
use tower::{Layer, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

pub use config::{
    ClientSettings, CustomTransport, DEFAULT_IDLE_CONN_TIMEOUT, DEFAULT_MAX_IDLE_CONNS,
};
pub use layers::{CompressionLayer, CompressionService, HeaderLayer, HeaderService};

use crate::capability::{CapabilityHost, ComponentId, resolve_client_authenticator};
use crate::compression::{CodecRegistry, CompressionType};
use crate::error::{ConfigError, HttpError};
use crate::{RequestBody, ResponseBody};
use layers::ConnectionLimitLayer;
use proxy::{ProxyConnector, ProxyResolver};

/// Type-erased request executor every client layer implements.
pub type Transport = BoxCloneSyncService<Request<RequestBody>, Response<ResponseBody>, HttpError>;

/// One wrapper in a built client pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportLayer {
    Compression(CompressionType),
    Headers,
    Auth(ComponentId),
    Custom,
    Base,
}

/// Client produced by [`ClientSettings::to_client`].
#[derive(Clone)]
pub struct HttpClient {
    transport: Transport,
    layers: Arc<[TransportLayer]>,
    timeout: Option<Duration>,
    endpoint: String,
}

impl HttpClient {
    /// Layers of the pipeline, outermost first, ending with the base transport.
    #[must_use]
    pub fn layers(&self) -> &[TransportLayer] {
        &self.layers
    }

    /// The composed pipeline without the client-level timeout.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends `request` through the pipeline.
    ///
    /// Any HTTP status is a successful response; only transport failures
    /// and the configured timeout produce errors.
    ///
    /// # Errors
    /// [`HttpError::Timeout`] when the configured timeout elapses, otherwise
    /// whatever the pipeline reports.
    pub async fn send(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>, HttpError> {
        let call = self.transport.clone().oneshot(request);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| HttpError::Timeout(limit))?,
            None => call.await,
        }
    }

    /// # Errors
    /// See [`HttpClient::send`]; also fails on an invalid `url`.
    pub async fn get(&self, url: &str) -> Result<Response<ResponseBody>, HttpError> {
        self.send(Request::get(url).body(Full::default())?).await
    }

    /// # Errors
    /// See [`HttpClient::send`]; also fails on an invalid `url`.
    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Bytes>,
    ) -> Result<Response<ResponseBody>, HttpError> {
        self.send(Request::post(url).body(Full::new(body.into()))?).await
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("endpoint", &self.endpoint)
            .field("layers", &self.layers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClientSettings {
    /// Builds a client using the built-in codecs.
    ///
    /// # Errors
    /// See [`ClientSettings::to_client_with_codecs`].
    pub fn to_client(&self, host: &dyn CapabilityHost) -> Result<HttpClient, ConfigError> {
        self.to_client_with_codecs(host, &CodecRegistry::default())
    }

    /// Builds a client, taking request body encoders from `codecs`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when TLS material cannot be loaded, the proxy
    /// URL is invalid, the custom transport hook fails, the authenticator
    /// cannot be resolved or refuses to wrap, a header is malformed, or no
    /// encoder exists for the compression.
    pub fn to_client_with_codecs(
        &self,
        host: &dyn CapabilityHost,
        codecs: &CodecRegistry,
    ) -> Result<HttpClient, ConfigError> {
        let mut transport = base_transport(self)?;
        let mut layers = vec![TransportLayer::Base];

        if let Some(hook) = &self.custom_transport {
            transport = hook.apply(transport).map_err(ConfigError::CustomTransport)?;
            layers.push(TransportLayer::Custom);
        }

        if let Some(auth) = &self.auth {
            let id = &auth.authenticator;
            let authenticator = resolve_client_authenticator(Some(host), id).map_err(|source| {
                ConfigError::AuthResolution {
                    id: id.clone(),
                    source,
                }
            })?;
            transport = authenticator
                .wrap_transport(transport)
                .map_err(|source| ConfigError::AuthWrap {
                    id: id.clone(),
                    source,
                })?;
            layers.push(TransportLayer::Auth(id.clone()));
        }

        if !self.headers.is_empty() {
            let layer = HeaderLayer::try_new(&self.headers)?;
            transport = BoxCloneSyncService::new(layer.layer(transport));
            layers.push(TransportLayer::Headers);
        }

        if self.compression.is_compressed() {
            let layer = CompressionLayer::try_new(self.compression, codecs)?;
            transport = BoxCloneSyncService::new(layer.layer(transport));
            layers.push(TransportLayer::Compression(self.compression));
        }

        layers.reverse();
        tracing::debug!(
            endpoint = %self.endpoint,
            layers = layers.len(),
            compression = %self.compression,
            "built HTTP client"
        );

        Ok(HttpClient {
            transport,
            layers: layers.into(),
            timeout: self.timeout.filter(|t| !t.is_zero()),
            endpoint: self.endpoint.clone(),
        })
    }
}

/// hyper-util pooled client over rustls, proxy aware, with transparent
/// response decompression.
fn base_transport(settings: &ClientSettings) -> Result<Transport, ConfigError> {
    let tls = settings.tls.load_client_config()?;
    let proxy = ProxyResolver::from_settings(&settings.proxy_url)?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    if settings.read_buffer_size > 0 {
        http.set_recv_buffer_size(Some(settings.read_buffer_size));
    }
    if settings.write_buffer_size > 0 {
        http.set_send_buffer_size(Some(settings.write_buffer_size));
    }

    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(ProxyConnector::new(http, proxy));

    // pool_timer is required for pool_idle_timeout to take effect
    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .pool_timer(TokioTimer::new())
        .timer(TokioTimer::new())
        .pool_max_idle_per_host(settings.pool_max_idle_per_host());
    if !settings.idle_conn_timeout.is_zero() {
        builder.pool_idle_timeout(settings.idle_conn_timeout);
    }
    if let Some(interval) = settings.http2_read_idle_timeout.filter(|d| !d.is_zero()) {
        builder
            .http2_keep_alive_interval(interval)
            .http2_keep_alive_while_idle(true);
    }
    if let Some(timeout) = settings.http2_ping_timeout.filter(|d| !d.is_zero()) {
        builder.http2_keep_alive_timeout(timeout);
    }
    let client = builder.build::<_, RequestBody>(connector);

    let limit = settings
        .max_conns_per_host
        .filter(|n| *n > 0)
        .map(ConnectionLimitLayer::new);

    let service = ServiceBuilder::new()
        .layer(DecompressionLayer::new())
        .option_layer(limit)
        .service(client)
        .map_response(box_response)
        .map_err(|e: hyper_util::client::legacy::Error| HttpError::Transport(Box::new(e)));

    Ok(BoxCloneSyncService::new(service))
}

fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}
