use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use crate::error::ConfigError;
use crate::server::ServerSettings;

/// Bound socket, optionally terminating TLS, ready to be served.
pub struct ServerListener {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl ServerListener {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl std::fmt::Debug for ServerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerListener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// `host:port` to bind; a bare `:port` binds every interface.
pub(crate) fn bind_address(endpoint: &str) -> Result<String, ConfigError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason: "endpoint must not be empty".to_owned(),
        });
    }
    if endpoint.starts_with(':') {
        return Ok(format!("0.0.0.0{endpoint}"));
    }
    Ok(endpoint.to_owned())
}

impl ServerSettings {
    /// Binds the endpoint, wrapping it with TLS when configured.
    ///
    /// # Errors
    /// [`ConfigError::Tls`] for unusable TLS material,
    /// [`ConfigError::InvalidEndpoint`] or [`ConfigError::Bind`] when the
    /// socket cannot be opened.
    pub fn to_listener(&self) -> Result<ServerListener, ConfigError> {
        let tls = self
            .tls
            .as_ref()
            .map(crate::tls::TlsServerSettings::load_server_config)
            .transpose()?
            .map(|config| TlsAcceptor::from(Arc::new(config)));

        let address = bind_address(&self.endpoint)?;
        let bind_err = |source| ConfigError::Bind {
            endpoint: self.endpoint.clone(),
            source,
        };
        let listener = std::net::TcpListener::bind(&address).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(%local_addr, tls = tls.is_some(), "HTTP server listener bound");
        Ok(ServerListener {
            listener,
            local_addr,
            tls,
        })
    }
}

/// Accepts connections until `shutdown` fires, then drains in-flight
/// connections gracefully.
pub(crate) async fn serve(
    router: Router,
    listener: ServerListener,
    read_header_timeout: Option<Duration>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let ServerListener { listener, tls, .. } = listener;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let tracker = TaskTracker::new();

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        let router = router.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let service = hyper::service::service_fn(move |mut request: http::Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer));
                router.clone().oneshot(request)
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().timer(TokioTimer::new());
            if let Some(timeout) = read_header_timeout {
                builder.http1().header_read_timeout(timeout);
            }

            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        serve_connection(&builder, TokioIo::new(stream), service, &shutdown).await
                    }
                    Err(err) => {
                        tracing::debug!(%peer, error = %err, "TLS handshake failed");
                        return;
                    }
                },
                None => serve_connection(&builder, TokioIo::new(stream), service, &shutdown).await,
            };
            if let Err(err) = result {
                tracing::debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn serve_connection<I, S>(
    builder: &auto::Builder<TokioExecutor>,
    io: I,
    service: S,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: hyper::service::Service<http::Request<Incoming>, Response = axum::response::Response>
        + Send,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let connection = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(connection);
    tokio::select! {
        result = connection.as_mut() => result,
        () = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    }
}
