use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use http_body_util::{LengthLimitError, Limited};

use crate::auth::ServerAuthenticator;
use crate::compression::{CodecRegistry, DecodeFn};
use crate::server::ErrorHandler;

#[derive(Clone)]
pub(crate) struct AuthState {
    pub(crate) authenticator: Arc<dyn ServerAuthenticator>,
    pub(crate) error_handler: ErrorHandler,
}

/// Runs the resolved authenticator; the extensions it returns replace the
/// request's extensions for the rest of the chain.
pub(crate) async fn auth_middleware(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let extensions = std::mem::take(&mut parts.extensions);
    match state.authenticator.authenticate(extensions, &parts.headers).await {
        Ok(extensions) => {
            parts.extensions = extensions;
            next.run(Request::from_parts(parts, body)).await
        }
        Err(err) => {
            tracing::debug!(error = %err, uri = %parts.uri, "request authentication failed");
            (state.error_handler)(&parts, "Unauthorized", StatusCode::UNAUTHORIZED)
        }
    }
}

#[derive(Clone)]
pub(crate) struct DecodeState {
    pub(crate) custom: Arc<HashMap<String, DecodeFn>>,
    pub(crate) registry: Arc<CodecRegistry>,
    pub(crate) max_body: usize,
    pub(crate) error_handler: ErrorHandler,
}

impl DecodeState {
    fn decoder_for(&self, encoding: &str) -> Option<DecodeFn> {
        self.custom
            .get(encoding)
            .or_else(|| self.registry.decoder_for(encoding))
            .cloned()
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn exceeds_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Enforces the body limit and replaces an encoded body with its decoded
/// form. Every rejection goes through the error handler.
pub(crate) async fn decompress_middleware(
    State(state): State<DecodeState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let fail = |parts: &axum::http::request::Parts, message: &str, status: StatusCode| {
        tracing::debug!(%status, reason = message, "rejecting request body");
        (state.error_handler)(parts, message, status)
    };

    if content_length(&parts.headers).is_some_and(|len| len > state.max_body) {
        return fail(&parts, "request body too large", StatusCode::PAYLOAD_TOO_LARGE);
    }

    let encoding = match parts.headers.get(CONTENT_ENCODING).map(HeaderValue::to_str) {
        None => None,
        Some(Ok(value)) => Some(value.trim().to_owned()),
        Some(Err(_)) => {
            return fail(&parts, "invalid Content-Encoding header", StatusCode::BAD_REQUEST);
        }
    };
    let Some(encoding) = encoding.filter(|e| !e.is_empty() && e != "identity") else {
        let body = Body::new(Limited::new(body, state.max_body));
        return next.run(Request::from_parts(parts, body)).await;
    };

    let Some(decoder) = state.decoder_for(&encoding) else {
        let message = format!("unsupported Content-Encoding: {encoding}");
        return fail(&parts, &message, StatusCode::BAD_REQUEST);
    };

    let raw = match axum::body::to_bytes(body, state.max_body).await {
        Ok(raw) => raw,
        Err(err) if exceeds_limit(&err) => {
            return fail(&parts, "request body too large", StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(err) => {
            let message = format!("failed to read request body: {err}");
            return fail(&parts, &message, StatusCode::BAD_REQUEST);
        }
    };

    let max_body = state.max_body;
    let decoded = match tokio::task::spawn_blocking(move || decoder(&raw[..], max_body)).await {
        Ok(Ok(decoded)) => decoded,
        Ok(Err(err)) => {
            let message = format!("failed to decode {encoding} request body: {err}");
            return fail(&parts, &message, StatusCode::BAD_REQUEST);
        }
        Err(err) => {
            tracing::error!(error = %err, "request body decoder panicked");
            return fail(&parts, "failed to decode request body", StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    parts.headers.remove(CONTENT_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(decoded.len()));
    next.run(Request::from_parts(parts, Body::from(decoded))).await
}
