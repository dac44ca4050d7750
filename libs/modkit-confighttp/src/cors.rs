//! CORS decisioning for the server chain.
//!
//! Only requests carrying `Origin` are considered. An accepted preflight is
//! answered with `204 No Content` and never reaches the inner chain. If it
//! asks for headers outside the policy the `204` carries no CORS header. A
//! preflight from a foreign origin falls through to the inner chain without
//! any CORS header.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
    VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Headers a preflight may request when none are configured.
const DEFAULT_ALLOWED_HEADERS: [&str; 4] = ["origin", "accept", "content-type", "x-requested-with"];

/// Cross-origin policy of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsSettings {
    /// Origins allowed to make cross-origin requests. Each entry may contain
    /// one `*`; a lone `*` allows every origin. Empty disables CORS.
    pub allowed_origins: Vec<String>,
    /// Headers a preflight may ask for besides the defaults. `*` allows any.
    pub allowed_headers: Vec<String>,
    /// Seconds browsers may cache a preflight answer; 0 omits the header.
    pub max_age: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginPattern {
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl OriginPattern {
    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == origin,
            Self::Wildcard { prefix, suffix } => {
                origin.len() >= prefix.len() + suffix.len()
                    && origin.starts_with(prefix.as_str())
                    && origin.ends_with(suffix.as_str())
            }
        }
    }
}

/// Compiled form of [`CorsSettings`].
#[derive(Debug)]
pub(crate) struct CorsPolicy {
    any_origin: bool,
    origins: Vec<OriginPattern>,
    any_header: bool,
    allowed_headers: HashSet<String>,
    max_age: Option<HeaderValue>,
}

impl CorsPolicy {
    /// `None` when no origin is configured, meaning CORS is off.
    pub(crate) fn from_settings(settings: &CorsSettings) -> Result<Option<Self>, ConfigError> {
        if settings.allowed_origins.is_empty() {
            return Ok(None);
        }

        let mut any_origin = false;
        let mut origins = Vec::with_capacity(settings.allowed_origins.len());
        for raw in &settings.allowed_origins {
            let origin = raw.trim().to_ascii_lowercase();
            match origin.matches('*').count() {
                0 => origins.push(OriginPattern::Exact(origin)),
                1 if origin == "*" => any_origin = true,
                1 => {
                    let (prefix, suffix) = origin.split_once('*').unwrap_or_default();
                    origins.push(OriginPattern::Wildcard {
                        prefix: prefix.to_owned(),
                        suffix: suffix.to_owned(),
                    });
                }
                _ => return Err(ConfigError::InvalidCors(raw.clone())),
            }
        }
        if any_origin {
            tracing::warn!(
                "CORS is configured with allowed_origins=['*']; any website may make \
                 cross-origin requests to this server"
            );
        }

        let mut allowed_headers: HashSet<String> = if settings.allowed_headers.is_empty() {
            DEFAULT_ALLOWED_HEADERS.iter().map(|h| (*h).to_owned()).collect()
        } else {
            settings
                .allowed_headers
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect()
        };
        allowed_headers.insert("origin".to_owned());
        let any_header = allowed_headers.contains("*");

        let max_age = (settings.max_age > 0).then(|| HeaderValue::from(settings.max_age));

        Ok(Some(Self {
            any_origin,
            origins,
            any_header,
            allowed_headers,
            max_age,
        }))
    }

    /// Value for `Access-Control-Allow-Origin`, or `None` for a foreign origin.
    fn allow_origin(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        if self.any_origin {
            return Some(HeaderValue::from_static("*"));
        }
        let candidate = origin.to_str().ok()?.to_ascii_lowercase();
        self.origins
            .iter()
            .any(|pattern| pattern.matches(&candidate))
            .then(|| origin.clone())
    }

    fn headers_allowed(&self, requested: &HeaderValue) -> bool {
        if self.any_header {
            return true;
        }
        requested.to_str().is_ok_and(|list| {
            list.split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .all(|h| self.allowed_headers.contains(&h))
        })
    }

    /// Answer to an accepted preflight. A preflight asking for headers outside
    /// the policy is denied: still `204`, but without any `Access-Control-*`
    /// header, so the browser blocks the real request.
    fn preflight_response(&self, allow_origin: HeaderValue, request: &HeaderMap) -> Response {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(
            VARY,
            HeaderValue::from_static(
                "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
            ),
        );

        let requested = request.get(ACCESS_CONTROL_REQUEST_HEADERS);
        if let Some(requested) = requested {
            if !self.headers_allowed(requested) {
                tracing::debug!(?requested, "preflight requested headers outside the policy");
                return response;
            }
        }

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if let Some(method) = request
            .get(ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|m| m.to_str().ok())
            .and_then(|m| HeaderValue::from_str(&m.trim().to_ascii_uppercase()).ok())
        {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, method);
        }
        if let Some(requested) = requested {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
        response
    }
}

fn is_preflight(request: &Request) -> bool {
    request.method() == Method::OPTIONS
        && request.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

pub(crate) async fn cors_middleware(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(origin) = request.headers().get(ORIGIN).cloned() else {
        return next.run(request).await;
    };
    let allowed = policy.allow_origin(&origin);

    if is_preflight(&request) {
        return match allowed {
            Some(allow_origin) => policy.preflight_response(allow_origin, request.headers()),
            None => {
                tracing::debug!(?origin, "preflight from origin outside the CORS policy");
                next.run(request).await
            }
        };
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.append(VARY, HeaderValue::from_static("Origin"));
    if let Some(allow_origin) = allowed {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    }
    response
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn policy(origins: &[&str], headers: &[&str]) -> CorsPolicy {
        CorsPolicy::from_settings(&CorsSettings {
            allowed_origins: origins.iter().map(|o| (*o).to_owned()).collect(),
            allowed_headers: headers.iter().map(|h| (*h).to_owned()).collect(),
            max_age: 0,
        })
        .unwrap()
        .unwrap()
    }

    fn allows(policy: &CorsPolicy, origin: &'static str) -> Option<HeaderValue> {
        policy.allow_origin(&HeaderValue::from_static(origin))
    }

    #[test]
    fn no_origins_disables_cors() {
        let settings = CorsSettings {
            allowed_headers: vec!["x-extra".to_owned()],
            max_age: 600,
            ..CorsSettings::default()
        };
        assert!(CorsPolicy::from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn wildcard_matches_one_segment_pattern() {
        let p = policy(&["allowed-*.com"], &[]);
        assert_eq!(
            allows(&p, "allowed-origin.com"),
            Some(HeaderValue::from_static("allowed-origin.com"))
        );
        assert!(allows(&p, "disallowed-origin.com").is_none());
        assert!(allows(&p, "allowed-.co").is_none());
    }

    #[test]
    fn exact_match_is_case_insensitive_and_echoes_request_value() {
        let p = policy(&["https://App.example.com"], &[]);
        assert_eq!(
            allows(&p, "https://app.EXAMPLE.com"),
            Some(HeaderValue::from_static("https://app.EXAMPLE.com"))
        );
    }

    #[test]
    fn lone_star_allows_every_origin() {
        let p = policy(&["*"], &[]);
        assert_eq!(allows(&p, "https://anything.test"), Some(HeaderValue::from_static("*")));
    }

    #[test]
    fn more_than_one_wildcard_is_rejected() {
        let settings = CorsSettings {
            allowed_origins: vec!["https://*.*.example.com".to_owned()],
            ..CorsSettings::default()
        };
        assert!(matches!(
            CorsPolicy::from_settings(&settings),
            Err(ConfigError::InvalidCors(_))
        ));
    }

    #[test]
    fn requested_headers_must_all_be_allowed() {
        let p = policy(&["*"], &["X-Allowed"]);
        assert!(p.headers_allowed(&HeaderValue::from_static("x-allowed, Origin")));
        assert!(!p.headers_allowed(&HeaderValue::from_static("x-allowed, ExtraHeader")));

        let defaults = policy(&["*"], &[]);
        assert!(defaults.headers_allowed(&HeaderValue::from_static("Content-Type")));
        assert!(!defaults.headers_allowed(&HeaderValue::from_static("x-allowed")));

        let any = policy(&["*"], &["*"]);
        assert!(any.headers_allowed(&HeaderValue::from_static("whatever")));
    }

    #[test]
    fn preflight_with_disallowed_headers_is_denied() {
        let p = policy(&["allowed-*.com"], &[]);
        let mut request = HeaderMap::new();
        request.insert(ACCESS_CONTROL_REQUEST_METHOD, HeaderValue::from_static("post"));

        let granted =
            p.preflight_response(HeaderValue::from_static("allowed-origin.com"), &request);
        assert_eq!(granted.status(), StatusCode::NO_CONTENT);
        assert_eq!(granted.headers()[ACCESS_CONTROL_ALLOW_METHODS], "POST");

        request.insert(ACCESS_CONTROL_REQUEST_HEADERS, HeaderValue::from_static("ExtraHeader"));
        let denied =
            p.preflight_response(HeaderValue::from_static("allowed-origin.com"), &request);
        assert_eq!(denied.status(), StatusCode::NO_CONTENT);
        assert!(denied.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(denied.headers().get(ACCESS_CONTROL_ALLOW_METHODS).is_none());
        assert!(denied.headers().get(ACCESS_CONTROL_ALLOW_HEADERS).is_none());
    }
}
