//! Proxy selection and the connector that dials through it.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use http::uri::Scheme;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::proxy::matcher::{Intercept, Matcher};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower::{Service, ServiceExt};
use url::Url;

use crate::error::{BoxError, ConfigError};

/// Destinations that never go through an environment proxy.
const LOOPBACK_NO_PROXY: &str = "localhost, 127.0.0.0/8, ::1";

/// Decides which proxy, if any, a destination is reached through.
///
/// A configured URL applies to every destination. Otherwise `HTTP_PROXY`,
/// `HTTPS_PROXY`, `ALL_PROXY` and `NO_PROXY` (either case) are read once at
/// construction; `NO_PROXY` takes host, domain suffix, IP and CIDR entries.
#[derive(Clone)]
pub(crate) struct ProxyResolver {
    matcher: Arc<Matcher>,
}

impl fmt::Debug for ProxyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyResolver").field(&self.matcher).finish()
    }
}

impl ProxyResolver {
    /// Empty `proxy_url` selects the environment.
    pub(crate) fn from_settings(proxy_url: &str) -> Result<Self, ConfigError> {
        if proxy_url.is_empty() {
            return Ok(Self::from_lookup(|key| std::env::var(key).ok()));
        }
        let url = Url::parse(proxy_url).map_err(|source| ConfigError::InvalidProxyUrl {
            url: proxy_url.to_owned(),
            source,
        })?;
        if url.scheme() != "http" {
            return Err(ConfigError::UnsupportedProxyScheme(url.scheme().to_owned()));
        }
        Ok(Self::new(Matcher::builder().all(url.as_str()).build()))
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|v| !v.trim().is_empty())
        };
        let proxy = |upper: &str, lower: &str| {
            var(upper, lower)
                .filter(|v| usable_env_proxy(upper, v))
                .unwrap_or_default()
        };
        let no_proxy = match var("NO_PROXY", "no_proxy") {
            Some(list) => format!("{list}, {LOOPBACK_NO_PROXY}"),
            None => LOOPBACK_NO_PROXY.to_owned(),
        };
        Self::new(
            Matcher::builder()
                .all(proxy("ALL_PROXY", "all_proxy"))
                .http(proxy("HTTP_PROXY", "http_proxy"))
                .https(proxy("HTTPS_PROXY", "https_proxy"))
                .no(no_proxy)
                .build(),
        )
    }

    fn new(matcher: Matcher) -> Self {
        Self {
            matcher: Arc::new(matcher),
        }
    }

    pub(crate) fn proxy_for(&self, dst: &Uri) -> Option<Intercept> {
        self.matcher.intercept(dst)
    }
}

/// Only plain `http://` proxies are dialed; a value without a scheme means
/// `http://`.
fn usable_env_proxy(var: &str, raw: &str) -> bool {
    let raw = raw.trim();
    let parsed = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("http://{raw}"))
    };
    match parsed {
        Ok(url) if url.scheme() == "http" => true,
        Ok(url) => {
            tracing::warn!(var, scheme = url.scheme(), "ignoring proxy from environment with unsupported scheme");
            false
        }
        Err(err) => {
            tracing::warn!(var, error = %err, "ignoring unparsable proxy from environment");
            false
        }
    }
}

/// TCP stream that remembers whether it ends at an HTTP proxy, so that
/// HTTP/1 requests on it are written in absolute form.
pub(crate) struct ProxyStream {
    io: TokioIo<TcpStream>,
    proxied: bool,
}

impl Connection for ProxyStream {
    fn connected(&self) -> Connected {
        self.io.connected().proxy(self.proxied)
    }
}

impl Read for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

/// Connector dialing destinations directly or through the resolved proxy.
///
/// Plain HTTP destinations reuse the proxy connection with absolute-form
/// requests; HTTPS destinations get a `CONNECT` tunnel that TLS then runs
/// inside, carrying the proxy URL's credentials as Basic auth.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    http: HttpConnector,
    resolver: ProxyResolver,
}

impl ProxyConnector {
    pub(crate) fn new(http: HttpConnector, resolver: ProxyResolver) -> Self {
        Self { http, resolver }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ProxyStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let http = self.http.clone();
        let intercept = self.resolver.proxy_for(&dst);
        Box::pin(async move {
            let Some(intercept) = intercept else {
                let io = http.oneshot(dst).await?;
                return Ok(ProxyStream { io, proxied: false });
            };
            let proxy_uri = intercept.uri().clone();
            tracing::trace!(proxy = %proxy_uri, destination = %dst, "connecting through proxy");

            if dst.scheme() == Some(&Scheme::HTTPS) {
                let mut tunnel = Tunnel::new(proxy_uri, http);
                if let Some(auth) = intercept.basic_auth() {
                    tunnel = tunnel.with_auth(auth.clone());
                }
                let authority = dst.authority().map(ToString::to_string).unwrap_or_default();
                let io = tunnel.oneshot(dst).await?;
                tracing::debug!(%authority, "proxy tunnel established");
                Ok(ProxyStream { io, proxied: false })
            } else {
                let io = http.oneshot(proxy_uri).await?;
                Ok(ProxyStream { io, proxied: true })
            }
        })
    }
}
