use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderName, HeaderValue, Request};
use http_body_util::{BodyExt, Full};
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::RequestBody;
use crate::compression::{CodecRegistry, CompressionType, EncodeFn};
use crate::error::{ConfigError, HttpError};
use crate::opaque::OpaqueString;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Sets a fixed set of headers on every outgoing request, replacing any
/// value already present under the same name.
#[derive(Clone)]
pub struct HeaderLayer {
    headers: Arc<[(HeaderName, HeaderValue)]>,
}

impl HeaderLayer {
    /// Values are marked sensitive so they never show up in debug output.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidHeader`] for a name or value that is not
    /// valid in HTTP.
    pub fn try_new<S: std::hash::BuildHasher>(
        headers: &HashMap<String, OpaqueString, S>,
    ) -> Result<Self, ConfigError> {
        let invalid = |name: &str, reason: String| ConfigError::InvalidHeader {
            name: name.to_owned(),
            reason,
        };
        let headers = headers
            .iter()
            .map(|(name, value)| {
                let header = HeaderName::try_from(name.as_str())
                    .map_err(|e| invalid(name, e.to_string()))?;
                let mut value = HeaderValue::from_str(value.expose())
                    .map_err(|e| invalid(name, e.to_string()))?;
                value.set_sensitive(true);
                Ok((header, value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            headers: headers.into(),
        })
    }
}

impl<S> Layer<S> for HeaderLayer {
    type Service = HeaderService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HeaderService {
            inner,
            headers: Arc::clone(&self.headers),
        }
    }
}

#[derive(Clone)]
pub struct HeaderService<S> {
    inner: S,
    headers: Arc<[(HeaderName, HeaderValue)]>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for HeaderService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        for (name, value) in self.headers.iter() {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.inner.call(req)
    }
}

/// Compresses non-empty request bodies and sets `Content-Encoding`.
///
/// Requests that already carry a `Content-Encoding` are left alone.
#[derive(Clone)]
pub struct CompressionLayer {
    compression: CompressionType,
    encoding: HeaderValue,
    encoder: EncodeFn,
}

impl CompressionLayer {
    /// # Errors
    /// Returns [`ConfigError::UnsupportedCompression`] when `registry` has no
    /// encoder for `compression`.
    pub fn try_new(
        compression: CompressionType,
        registry: &CodecRegistry,
    ) -> Result<Self, ConfigError> {
        let token = compression.as_str();
        let encoder = registry
            .encoder_for(token)
            .cloned()
            .ok_or_else(|| ConfigError::UnsupportedCompression(token.to_owned()))?;
        Ok(Self {
            compression,
            encoding: HeaderValue::from_static(token),
            encoder,
        })
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CompressionService<S> {
    inner: S,
    layer: CompressionLayer,
}

impl<S> Service<Request<RequestBody>> for CompressionService<S>
where
    S: Service<Request<RequestBody>, Error = HttpError> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = BoxFuture<Result<S::Response, HttpError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move {
            if req.headers().contains_key(CONTENT_ENCODING) {
                return inner.call(req).await;
            }
            let (mut parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(never) => match never {},
            };
            if body.is_empty() {
                return inner.call(Request::from_parts(parts, Full::new(body))).await;
            }

            let compressed =
                (layer.encoder)(&body[..]).map_err(|source| HttpError::Compression {
                    encoding: layer.compression.to_string(),
                    source,
                })?;
            parts.headers.insert(CONTENT_ENCODING, layer.encoding);
            parts
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));
            inner
                .call(Request::from_parts(parts, Full::new(Bytes::from(compressed))))
                .await
        })
    }
}

/// Caps the number of in-flight requests per destination authority.
///
/// A host's semaphore lives only while a request to it is waiting or in
/// flight; the last one out removes it.
#[derive(Clone)]
pub(crate) struct ConnectionLimitLayer {
    per_host: usize,
    hosts: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl ConnectionLimitLayer {
    pub(crate) fn new(per_host: usize) -> Self {
        Self {
            per_host,
            hosts: Arc::default(),
        }
    }

    fn slot_for(&self, authority: String) -> HostSlot {
        let semaphore = Arc::clone(
            &self
                .hosts
                .entry(authority.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host))),
        );
        HostSlot {
            hosts: Arc::clone(&self.hosts),
            authority,
            semaphore: Some(semaphore),
            permit: None,
        }
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }
}

/// Holds a host's semaphore for one request and prunes the map entry once
/// nobody else references it.
struct HostSlot {
    hosts: Arc<DashMap<String, Arc<Semaphore>>>,
    authority: String,
    semaphore: Option<Arc<Semaphore>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl HostSlot {
    async fn acquire(&mut self) {
        let Some(semaphore) = &self.semaphore else {
            return;
        };
        if semaphore.available_permits() == 0 {
            tracing::trace!(authority = %self.authority, "waiting for per-host connection slot");
        }
        // never closed, so acquiring cannot fail
        self.permit = Arc::clone(semaphore).acquire_owned().await.ok();
    }
}

impl Drop for HostSlot {
    fn drop(&mut self) {
        drop(self.permit.take());
        drop(self.semaphore.take());
        // the map's own reference is the only one left when idle
        self.hosts
            .remove_if(&self.authority, |_, semaphore| Arc::strong_count(semaphore) == 1);
    }
}

impl<S> Layer<S> for ConnectionLimitLayer {
    type Service = ConnectionLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectionLimitService {
            inner,
            limits: self.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ConnectionLimitService<S> {
    inner: S,
    limits: ConnectionLimitLayer,
}

impl<S, ReqBody> Service<Request<ReqBody>> for ConnectionLimitService<S>
where
    S: Service<Request<ReqBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let authority = req
            .uri()
            .authority()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mut slot = self.limits.slot_for(authority);

        Box::pin(async move {
            slot.acquire().await;
            let result = inner.call(req).await;
            drop(slot);
            result
        })
    }
}
