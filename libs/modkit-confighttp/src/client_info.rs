//! Per-request identity of the calling client.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, StatusCode, Uri, header};
use axum::middleware::Next;
use axum::response::Response;

/// Address of the peer that sent the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAddr {
    Ip(IpAddr),
    /// Peer reported as `host:port` where the host is not an IP literal.
    Host(String),
}

impl ClientAddr {
    /// Parses a remote address given as `host:port` or a bare IP.
    /// Anything else yields `None`.
    #[must_use]
    pub fn parse(remote: &str) -> Option<Self> {
        if let Ok(addr) = remote.parse::<SocketAddr>() {
            return Some(Self::Ip(addr.ip()));
        }
        if let Ok(ip) = remote.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Some(Self::Ip(ip));
        }
        match remote.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Some(Self::Host(host.to_owned()))
            }
            _ => None,
        }
    }
}

/// Request headers as a multi-map with case-insensitive keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: HashMap<String, Vec<String>>,
}

impl Metadata {
    /// Copies every header and records the request host under `host`.
    #[must_use]
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let mut entries: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            entries
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or_else(|| uri.authority().map(ToString::to_string));
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            entries.insert(header::HOST.as_str().to_owned(), vec![host]);
        }
        Self { entries }
    }

    /// All values recorded for `key`; empty when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity attached to every request the server handles.
///
/// Extract it in handlers with `ClientInfo` as an argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub addr: Option<ClientAddr>,
    /// Empty unless the server was built with `include_metadata`.
    pub metadata: Metadata,
}

impl ClientInfo {
    #[must_use]
    pub fn derive(
        remote: Option<ClientAddr>,
        headers: &HeaderMap,
        uri: &Uri,
        include_metadata: bool,
    ) -> Self {
        let metadata = if include_metadata {
            Metadata::from_request(headers, uri)
        } else {
            Metadata::default()
        };
        Self {
            addr: remote,
            metadata,
        }
    }
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<ClientInfo>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "client info not found - server middleware not configured",
        ))
    }
}

/// Peer address of the connection: the socket address the listener records,
/// or a textual `ConnectInfo<String>` set by a custom acceptor.
fn remote_addr(extensions: &Extensions) -> Option<ClientAddr> {
    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(ClientAddr::Ip(addr.ip()));
    }
    extensions
        .get::<ConnectInfo<String>>()
        .and_then(|ConnectInfo(remote)| ClientAddr::parse(remote))
}

pub(crate) async fn client_info_middleware(
    State(include_metadata): State<bool>,
    mut request: Request,
    next: Next,
) -> Response {
    let remote = remote_addr(request.extensions());
    let info = ClientInfo::derive(remote, request.headers(), request.uri(), include_metadata);
    request.extensions_mut().insert(info);
    next.run(request).await
}
