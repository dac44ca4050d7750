use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Authentication;
use crate::client::Transport;
use crate::compression::CompressionType;
use crate::error::BoxError;
use crate::opaque::OpaqueString;
use crate::tls::TlsClientSettings;

pub const DEFAULT_MAX_IDLE_CONNS: usize = 100;
pub const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// Hook that replaces the base transport with a caller-built one.
///
/// It receives the fully configured base transport and usually wraps it.
#[derive(Clone)]
pub struct CustomTransport(Arc<dyn Fn(Transport) -> Result<Transport, BoxError> + Send + Sync>);

impl CustomTransport {
    pub fn new(
        hook: impl Fn(Transport) -> Result<Transport, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(hook))
    }

    pub(crate) fn apply(&self, base: Transport) -> Result<Transport, BoxError> {
        (self.0)(base)
    }
}

impl fmt::Debug for CustomTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomTransport(..)")
    }
}

/// Declarative settings of an outbound HTTP client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Target URL; informational for the builder, used by callers.
    pub endpoint: String,
    /// Proxy for every request. Empty means `HTTP_PROXY`/`HTTPS_PROXY`.
    pub proxy_url: String,
    pub tls: TlsClientSettings,
    /// Socket receive buffer in bytes; 0 keeps the OS default.
    pub read_buffer_size: usize,
    /// Socket send buffer in bytes; 0 keeps the OS default.
    pub write_buffer_size: usize,
    /// Deadline for a whole request including reading response headers.
    #[serde(with = "crate::humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Headers set on every request.
    pub headers: HashMap<String, OpaqueString>,
    #[serde(skip)]
    pub custom_transport: Option<CustomTransport>,
    pub auth: Option<Authentication>,
    pub compression: CompressionType,
    /// Upper bound of idle pooled connections kept per host when
    /// `max_idle_conns_per_host` is unset.
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: Option<usize>,
    /// Cap on in-flight requests per host; unset means unlimited.
    pub max_conns_per_host: Option<usize>,
    /// How long an idle pooled connection is kept; 0 keeps it forever.
    #[serde(with = "crate::humantime_serde")]
    pub idle_conn_timeout: Duration,
    /// Use every connection for a single request only.
    pub disable_keep_alives: bool,
    /// Interval of HTTP/2 health-check pings on a connection.
    #[serde(with = "crate::humantime_serde::option")]
    pub http2_read_idle_timeout: Option<Duration>,
    /// How long to wait for a ping acknowledgement before closing.
    #[serde(with = "crate::humantime_serde::option")]
    pub http2_ping_timeout: Option<Duration>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            proxy_url: String::new(),
            tls: TlsClientSettings::default(),
            read_buffer_size: 0,
            write_buffer_size: 0,
            timeout: None,
            headers: HashMap::new(),
            custom_transport: None,
            auth: None,
            compression: CompressionType::None,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_idle_conns_per_host: None,
            max_conns_per_host: None,
            idle_conn_timeout: DEFAULT_IDLE_CONN_TIMEOUT,
            disable_keep_alives: false,
            http2_read_idle_timeout: None,
            http2_ping_timeout: None,
        }
    }
}

impl ClientSettings {
    pub(crate) fn pool_max_idle_per_host(&self) -> usize {
        if self.disable_keep_alives {
            0
        } else {
            self.max_idle_conns_per_host.unwrap_or(self.max_idle_conns)
        }
    }
}
