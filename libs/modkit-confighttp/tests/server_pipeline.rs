#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Server middleware chain driven through `Router::oneshot`.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Extension};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use http::Extensions;
use modkit_confighttp::{
    AuthError, Authentication, Capabilities, Capability, ClientAddr, ClientInfo, ComponentId,
    ConfigError, HttpServer, NopHost, OpaqueString, ResolveError, ServerAuthenticatorFn,
    ServerOptions, ServerSettings,
};
use tower::ServiceExt;

#[derive(Debug, Clone)]
struct Subject(String);

fn auth_id() -> ComponentId {
    "headerauth".parse().unwrap()
}

fn echo_router(hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/echo",
        post(move |body: Bytes| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                body
            }
        }),
    )
}

fn local() -> ServerSettings {
    ServerSettings {
        endpoint: "127.0.0.1:0".to_owned(),
        ..ServerSettings::default()
    }
}

fn build(settings: &ServerSettings, host: &Capabilities, router: Router) -> HttpServer {
    settings
        .to_server(host, router, ServerOptions::new())
        .unwrap()
}

async fn call(server: &HttpServer, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = server.router().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn always_fails() -> Capabilities {
    Capabilities::new().with(
        auth_id(),
        Capability::server(Arc::new(ServerAuthenticatorFn::new(
            |_ext: Extensions, _headers: &HeaderMap| {
                Err(AuthError::Unauthenticated("no credentials".to_owned()))
            },
        ))),
    )
}

fn with_auth() -> ServerSettings {
    ServerSettings {
        auth: Some(Authentication {
            authenticator: auth_id(),
        }),
        ..local()
    }
}

#[tokio::test]
async fn failed_authentication_short_circuits_with_401() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = build(&with_auth(), &always_fails(), echo_router(Arc::clone(&hits)));

    for _ in 0..3 {
        let request = Request::post("/echo").body(Body::from("data")).unwrap();
        let (status, _, body) = call(&server, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(String::from_utf8_lossy(&body).contains("Unauthorized"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn successful_authentication_replaces_extensions() {
    let host = Capabilities::new().with(
        auth_id(),
        Capability::server(Arc::new(ServerAuthenticatorFn::new(
            |mut ext: Extensions, headers: &HeaderMap| {
                let user = headers
                    .get("x-user")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| AuthError::Unauthenticated("missing x-user".to_owned()))?;
                ext.insert(Subject(user.to_owned()));
                Ok(ext)
            },
        ))),
    );
    let router = Router::new().route(
        "/whoami",
        get(|Extension(subject): Extension<Subject>| async move { subject.0 }),
    );
    let server = build(&with_auth(), &host, router);

    let request = Request::get("/whoami")
        .header("x-user", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "alice");

    let anonymous = Request::get("/whoami").body(Body::empty()).unwrap();
    assert_eq!(call(&server, anonymous).await.0, StatusCode::UNAUTHORIZED);
}

#[test]
fn unresolvable_authenticator_aborts_construction() {
    let err = with_auth()
        .to_server(&NopHost, Router::new(), ServerOptions::new())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        r#"failed to resolve authenticator "headerauth": authenticator not found"#
    );

    let client_only = Capabilities::new().with(auth_id(), Capability::default());
    let err = with_auth()
        .to_server(&client_only, Router::new(), ServerOptions::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::AuthResolution {
            source: ResolveError::NotServerAuthenticator(_),
            ..
        }
    ));
}

#[tokio::test]
async fn gzip_request_body_is_decoded_for_the_handler() {
    let server = build(&local(), &Capabilities::new(), echo_router(Arc::default()));
    let request = Request::post("/echo")
        .header("content-encoding", "gzip")
        .body(Body::from(gzip(b"compressed payload")))
        .unwrap();
    let (status, _, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "compressed payload");
}

#[tokio::test]
async fn identity_encoding_passes_through() {
    let server = build(&local(), &Capabilities::new(), echo_router(Arc::default()));
    let request = Request::post("/echo")
        .header("content-encoding", "identity")
        .body(Body::from("plain"))
        .unwrap();
    let (status, _, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "plain");
}

#[tokio::test]
async fn unknown_encoding_goes_through_the_error_handler() {
    let hits = Arc::new(AtomicUsize::new(0));
    let server = build(&local(), &Capabilities::new(), echo_router(Arc::clone(&hits)));
    let request = Request::post("/echo")
        .header("content-encoding", "unknown-token")
        .body(Body::from("data"))
        .unwrap();
    let (status, headers, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
    assert_eq!(body, "unsupported Content-Encoding: unknown-token\n");

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let options = ServerOptions::new().with_error_handler(
        move |_parts: &http::request::Parts, message: &str, status: StatusCode| {
            record.lock().push((status, message.to_owned()));
            (StatusCode::INTERNAL_SERVER_ERROR, "remapped").into_response()
        },
    );
    let server = local()
        .to_server(&NopHost, echo_router(Arc::clone(&hits)), options)
        .unwrap();
    let request = Request::post("/echo")
        .header("content-encoding", "unknown-token")
        .body(Body::from("data"))
        .unwrap();
    let (status, _, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "remapped");
    assert_eq!(
        seen.lock().as_slice(),
        &[(
            StatusCode::BAD_REQUEST,
            "unsupported Content-Encoding: unknown-token".to_owned()
        )]
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn custom_decoder_takes_precedence() {
    let options = ServerOptions::new()
        .with_decoder("reverse", |body: &[u8], _limit: usize| {
            Ok(body.iter().rev().copied().collect())
        })
        .with_decoder("gzip", |_body: &[u8], _limit: usize| Ok(b"overridden".to_vec()));
    let server = local()
        .to_server(&NopHost, echo_router(Arc::default()), options)
        .unwrap();

    let request = Request::post("/echo")
        .header("content-encoding", "reverse")
        .body(Body::from("olleh"))
        .unwrap();
    assert_eq!(call(&server, request).await.2, "hello");

    let request = Request::post("/echo")
        .header("content-encoding", "gzip")
        .body(Body::from(gzip(b"ignored")))
        .unwrap();
    assert_eq!(call(&server, request).await.2, "overridden");
}

#[tokio::test]
async fn corrupt_body_is_a_bad_request() {
    let server = build(&local(), &Capabilities::new(), echo_router(Arc::default()));
    let request = Request::post("/echo")
        .header("content-encoding", "gzip")
        .body(Body::from("definitely not gzip"))
        .unwrap();
    let (status, _, body) = call(&server, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).starts_with("failed to decode gzip request body"));
}

#[tokio::test]
async fn body_limit_applies_to_raw_and_decoded_bodies() {
    let settings = ServerSettings {
        max_request_body_size: 128,
        ..local()
    };
    let server = build(&settings, &Capabilities::new(), echo_router(Arc::default()));

    let request = Request::post("/echo")
        .header("content-length", "1000")
        .body(Body::from(vec![b'a'; 1000]))
        .unwrap();
    assert_eq!(call(&server, request).await.0, StatusCode::PAYLOAD_TOO_LARGE);

    // small on the wire, large once decoded
    let request = Request::post("/echo")
        .header("content-encoding", "gzip")
        .body(Body::from(gzip(&[b'a'; 4096])))
        .unwrap();
    assert_eq!(call(&server, request).await.0, StatusCode::BAD_REQUEST);

    let request = Request::post("/echo").body(Body::from("short")).unwrap();
    assert_eq!(call(&server, request).await.0, StatusCode::OK);
}

#[tokio::test]
async fn oversized_body_without_content_length_is_too_large() {
    let settings = ServerSettings {
        max_request_body_size: 128,
        ..local()
    };
    let server = build(&settings, &Capabilities::new(), echo_router(Arc::default()));

    // no Content-Length header, so only reading the body can tell
    for encoding in [None, Some("gzip")] {
        let mut request = Request::post("/echo");
        if let Some(encoding) = encoding {
            request = request.header("content-encoding", encoding);
        }
        let request = request.body(Body::from(vec![b'a'; 512])).unwrap();
        assert!(!request.headers().contains_key("content-length"));
        assert_eq!(
            call(&server, request).await.0,
            StatusCode::PAYLOAD_TOO_LARGE,
            "encoding {encoding:?}"
        );
    }
}

#[tokio::test]
async fn static_response_headers_are_set() {
    let settings = ServerSettings {
        response_headers: HashMap::from([
            ("x-served-by".to_owned(), OpaqueString::from("collector")),
            ("cache-control".to_owned(), OpaqueString::from("no-store")),
        ]),
        ..with_auth()
    };
    let server = build(&settings, &always_fails(), echo_router(Arc::default()));
    let request = Request::post("/echo").body(Body::from("x")).unwrap();
    let (status, headers, _) = call(&server, request).await;
    // response headers sit inside authentication
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(!headers.contains_key("x-served-by"));

    let server = build(
        &ServerSettings {
            auth: None,
            ..settings
        },
        &Capabilities::new(),
        echo_router(Arc::default()),
    );
    let request = Request::post("/echo").body(Body::from("x")).unwrap();
    let (status, headers, _) = call(&server, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-served-by"], "collector");
    assert_eq!(headers["cache-control"], "no-store");
}

fn client_info_router() -> Router {
    Router::new().route(
        "/info",
        get(|info: ClientInfo| async move {
            let addr = match info.addr {
                Some(ClientAddr::Ip(ip)) => ip.to_string(),
                Some(ClientAddr::Host(host)) => host,
                None => "unknown".to_owned(),
            };
            let tenant = info.metadata.get("X-Tenant").join(",");
            let host = info.metadata.get("host").join(",");
            format!("{addr}|{tenant}|{host}")
        }),
    )
}

fn info_request() -> Request<Body> {
    let mut request = Request::get("/info")
        .header("host", "collector.local:4318")
        .header("x-tenant", "acme")
        .header("x-tenant", "globex")
        .body(Body::empty())
        .unwrap();
    let peer: SocketAddr = "10.1.2.3:55000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

#[tokio::test]
async fn client_info_includes_metadata_when_enabled() {
    let settings = ServerSettings {
        include_metadata: true,
        ..local()
    };
    let server = build(&settings, &Capabilities::new(), client_info_router());
    let (status, _, body) = call(&server, info_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "10.1.2.3|acme,globex|collector.local:4318");
}

#[tokio::test]
async fn client_info_omits_metadata_by_default() {
    let server = build(&local(), &Capabilities::new(), client_info_router());
    let (_, _, body) = call(&server, info_request()).await;
    assert_eq!(body, "10.1.2.3||");

    let without_peer = Request::get("/info").body(Body::empty()).unwrap();
    let (_, _, body) = call(&server, without_peer).await;
    assert_eq!(body, "unknown||");
}

#[tokio::test]
async fn client_info_accepts_textual_peer_address() {
    let server = build(&local(), &Capabilities::new(), client_info_router());
    let mut request = Request::get("/info").body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo("gateway.local:443".to_owned()));
    let (_, _, body) = call(&server, request).await;
    assert_eq!(body, "gateway.local||");
}
