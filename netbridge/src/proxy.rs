//! HTTP front-end: accepts inbound requests, synthesizes `request` messages,
//! and writes back the correlated `response`. Also hosts the WebSocket
//! upgrade endpoint on the server role.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, ProxyMode, Role};
use crate::correlator::Correlator;
use crate::error::{Result, WaitError};
use crate::executor::RequestExecutor;
use crate::protocol::{message_id, Headers, HttpRequestEnvelope, HttpResponseEnvelope, Topic};
use crate::router::Status;
use crate::session::Session;

pub const HEALTH_PATH: &str = "/_health";
pub const WS_PATH: &str = "/_ws";

const AUTH_HEADER: &str = "x-auth-secret";
const PROXY_TYPE_HEADER: &str = "x-proxy-type";

/// Inbound bodies are buffered in full before forwarding.
const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Proxy-control headers never forwarded to the origin.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-auth-secret",
    "x-proxy-type",
];

/// Hop-by-hop headers never copied from a tunnelled response to the caller.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "content-encoding",
];

#[derive(Clone)]
struct Tunnel {
    session: Session,
    correlator: Arc<Correlator>,
}

/// Shared state behind the axum handlers. One live tunnel at a time; a new
/// upgrade replaces (and closes) the previous session.
#[derive(Clone)]
pub struct ProxyState {
    config: Arc<Config>,
    executor: Arc<RequestExecutor>,
    tunnel: Arc<RwLock<Option<Tunnel>>>,
}

impl ProxyState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let executor = Arc::new(RequestExecutor::new(&config)?);
        Ok(ProxyState {
            config,
            executor,
            tunnel: Arc::new(RwLock::new(None)),
        })
    }

    /// Adopt a session: wire its correlator dispatch and request executor,
    /// closing whatever session was live before.
    pub async fn install_session(&self, session: Session) {
        let correlator = Arc::new(Correlator::new());
        let previous = self.tunnel.write().await.replace(Tunnel {
            session: session.clone(),
            correlator: correlator.clone(),
        });
        if let Some(previous) = previous {
            info!("replacing the connected tunnel session");
            previous.session.close().await;
        }

        tokio::spawn(correlator.dispatch(session.subscribe(Topic::Response)));
        tokio::spawn(self.executor.clone().run(session.clone()));

        let mut status = session.subscribe_status();
        tokio::spawn(async move {
            while let Ok(event) = status.recv().await {
                match event {
                    Status::Connected => info!("tunnel session connected"),
                    Status::Error(message) => warn!(%message, "tunnel session error"),
                    Status::Disconnected => {
                        info!("tunnel session disconnected");
                        break;
                    }
                }
            }
        });
    }

    async fn tunnel(&self) -> Option<Tunnel> {
        self.tunnel
            .read()
            .await
            .as_ref()
            .filter(|tunnel| !tunnel.session.is_closed())
            .cloned()
    }

    /// Whether a live tunnel session is installed.
    pub async fn connected(&self) -> bool {
        self.tunnel().await.is_some()
    }

    /// In-flight waiters on the live tunnel; zero when none is connected.
    pub async fn pending_responses(&self) -> usize {
        match self.tunnel.read().await.as_ref() {
            Some(tunnel) => tunnel.correlator.pending(),
            None => 0,
        }
    }

    async fn forward_tunnel(&self, envelope: HttpRequestEnvelope) -> Response {
        let Some(tunnel) = self.tunnel().await else {
            return plain(StatusCode::BAD_GATEWAY, "no tunnel client connected");
        };
        let payload = match envelope.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                return plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to encode request: {err}"),
                )
            }
        };

        let id = message_id();
        let response = tunnel.correlator.register(id.clone());
        if let Err(err) = tunnel
            .session
            .send_with_id(&id, Topic::Request, &payload)
            .await
        {
            return plain(StatusCode::BAD_GATEWAY, format!("tunnel send failed: {err}"));
        }

        match timeout(self.config.request_timeout, response).await {
            Ok(Ok(envelope)) => envelope_response(envelope),
            Ok(Err(WaitError::Disconnected)) => {
                plain(StatusCode::BAD_GATEWAY, "tunnel disconnected")
            }
            Ok(Err(WaitError::Cancelled)) => {
                plain(StatusCode::GATEWAY_TIMEOUT, "request cancelled")
            }
            Err(_) => plain(
                StatusCode::GATEWAY_TIMEOUT,
                "timed out waiting for tunnel response",
            ),
        }
    }
}

/// Build the axum router for the configured role.
pub fn router(state: ProxyState) -> Router {
    let mut router = Router::new().route(HEALTH_PATH, get(health_handler));
    if state.config.role == Role::Server {
        router = router.route(WS_PATH, get(ws_handler));
    }
    router
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured port (TLS when both PEM files are set) and serve.
pub async fn serve(state: ProxyState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let tls_files = state
        .config
        .ssl_cert_file
        .clone()
        .zip(state.config.ssl_key_file.clone());

    if let Some((cert, key)) = tls_files {
        let tls = RustlsConfig::from_pem_file(cert, key).await?;
        info!(%addr, role = ?state.config.role, "https server listening");
        axum_server::bind_rustls(addr, tls)
            .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
            .await?;
        Ok(())
    } else {
        let listener = TcpListener::bind(addr).await?;
        serve_with_listener(state, listener).await
    }
}

/// Serve on an already-bound listener (used by tests and by `serve`).
pub async fn serve_with_listener(state: ProxyState, listener: TcpListener) -> Result<()> {
    info!(addr = %listener.local_addr()?, role = ?state.config.role, "http server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Allow-list and `X-Auth-SECRET` checks. `/_health` is open. `/_ws` passes
/// the allow-list like every other route but is exempt only from the secret
/// check: the upgrade authenticates with `Authorization` in its own handler.
async fn guard(State(state): State<ProxyState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == HEALTH_PATH {
        return next.run(request).await;
    }

    if !state.config.white_list.is_empty() {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let allowed = state.config.white_list.iter().any(|entry| {
            remote.as_deref().is_some_and(|addr| addr.starts_with(entry))
                || (!host.is_empty() && host.ends_with(entry))
        });
        if !allowed {
            return plain(StatusCode::FORBIDDEN, "Forbidden");
        }
    }

    if path != WS_PATH {
        if let Some(secret) = &state.config.secret {
            if state.config.role != Role::Client {
                let presented = request
                    .headers()
                    .get(AUTH_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                if !constant_time_eq(presented, secret) {
                    return plain(StatusCode::FORBIDDEN, "Forbidden");
                }
            }
        }
    }

    next.run(request).await
}

/// WebSocket upgrade establishing the tunnel session (server role).
async fn ws_handler(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(secret) = &state.config.secret {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !constant_time_eq(presented, secret) {
            return plain(StatusCode::FORBIDDEN, "Forbidden");
        }
    }

    ws.on_upgrade(move |socket| async move {
        info!("tunnel client connected");
        let session = Session::accept(socket, &state.config.session);
        state.install_session(session).await;
    })
}

/// Catch-all: buffer the body, compute the target, and forward by mode.
async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let mode = match parts.headers.get(PROXY_TYPE_HEADER) {
        Some(value) => match value.to_str().unwrap_or_default().parse::<ProxyMode>() {
            Ok(mode) => mode,
            Err(_) => return plain(StatusCode::BAD_REQUEST, "invalid X-Proxy-Type"),
        },
        None => state.config.proxy_mode,
    };

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(_) => return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let url = match target_url(mode, &parts.headers, &parts.uri, &state.config) {
        Ok(url) => url,
        Err(message) => return plain(StatusCode::BAD_REQUEST, message),
    };

    let envelope = HttpRequestEnvelope {
        method: parts.method.as_str().to_uppercase(),
        url,
        headers: collect_request_headers(&parts.headers),
        body: body.to_vec(),
    };

    match mode {
        ProxyMode::Wss => state.forward_tunnel(envelope).await,
        ProxyMode::Server | ProxyMode::Proxy => {
            envelope_response(state.executor.execute(envelope).await)
        }
    }
}

/// Absolute target URL for the forwarded request.
fn target_url(
    mode: ProxyMode,
    headers: &HeaderMap,
    uri: &Uri,
    config: &Config,
) -> std::result::Result<String, &'static str> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if mode == ProxyMode::Server {
        let base = config
            .server_url
            .as_deref()
            .ok_or("SERVER_URL is not configured")?;
        return Ok(format!("{}{}", base.trim_end_matches('/'), path_and_query));
    }

    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let proto = header_value("x-forwarded-proto")
        .or_else(|| config.forwarded_proto.clone())
        .ok_or("missing X-Forwarded-Proto")?;
    let host = header_value("x-forwarded-host")
        .or_else(|| config.forwarded_host.clone())
        .ok_or("missing X-Forwarded-Host")?;

    Ok(format!("{proto}://{host}{path_and_query}"))
}

/// Clone the caller's headers minus the proxy-control set.
fn collect_request_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        if STRIPPED_REQUEST_HEADERS
            .iter()
            .any(|stripped| name.as_str().eq_ignore_ascii_case(stripped))
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower.starts_with("sec-websocket-")
}

/// Tunnelled response envelope → HTTP response, minus hop-by-hop headers.
fn envelope_response(envelope: HttpResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(header_map) = builder.headers_mut() {
        for (name, values) in &envelope.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    header_map.append(header_name.clone(), header_value);
                }
            }
        }
    }
    builder
        .body(Body::from(envelope.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn plain(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

fn constant_time_eq(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use super::*;

    fn server_state(config: Config) -> ProxyState {
        ProxyState::new(Arc::new(Config {
            role: Role::Server,
            ..config
        }))
        .unwrap()
    }

    async fn send(
        state: ProxyState,
        request: HttpRequest<Body>,
    ) -> (StatusCode, axum::http::HeaderMap) {
        let response = router(state).oneshot(request).await.unwrap();
        (response.status(), response.headers().clone())
    }

    #[tokio::test]
    async fn health_route_answers_ok() {
        let state = server_state(Config::default());
        let (status, _) = send(
            state,
            HttpRequest::get(HEALTH_PATH).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_forward_target_is_a_bad_request() {
        let state = server_state(Config::default());
        let (status, _) = send(
            state,
            HttpRequest::get("/anything").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn no_connected_client_is_a_bad_gateway() {
        let state = server_state(Config::default());
        let request = HttpRequest::get("/echo")
            .header("X-Forwarded-Proto", "http")
            .header("X-Forwarded-Host", "target.local:9000")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn secret_gates_the_proxy_but_not_health() {
        let config = Config {
            secret: Some("s3cr3t".to_string()),
            ..Config::default()
        };

        let (status, _) = send(
            server_state(config.clone()),
            HttpRequest::get(HEALTH_PATH).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            server_state(config.clone()),
            HttpRequest::get("/x").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            server_state(config.clone()),
            HttpRequest::get("/x")
                .header("X-Auth-SECRET", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Correct secret passes the guard; 502 because no client is connected.
        let (status, _) = send(
            server_state(config),
            HttpRequest::get("/x")
                .header("X-Auth-SECRET", "s3cr3t")
                .header("X-Forwarded-Proto", "http")
                .header("X-Forwarded-Host", "target.local")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    fn with_remote(mut request: HttpRequest<Body>, addr: [u8; 4]) -> HttpRequest<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((addr, 40000))));
        request
    }

    #[tokio::test]
    async fn allow_list_gates_inbound_remote_addresses() {
        let config = Config {
            white_list: vec!["10.0.0.".to_string()],
            ..Config::default()
        };

        let denied = with_remote(
            HttpRequest::get("/x").body(Body::empty()).unwrap(),
            [192, 168, 1, 5],
        );
        let (status, _) = send(server_state(config.clone()), denied).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // A listed remote passes the guard; 502 because no client is connected.
        let allowed = with_remote(
            HttpRequest::get("/x")
                .header("X-Forwarded-Proto", "http")
                .header("X-Forwarded-Host", "target.local")
                .body(Body::empty())
                .unwrap(),
            [10, 0, 0, 7],
        );
        let (status, _) = send(server_state(config), allowed).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn allow_list_matches_host_suffixes() {
        let config = Config {
            white_list: vec!["allowed.test".to_string()],
            ..Config::default()
        };

        let by_host = HttpRequest::get("/x")
            .header("Host", "svc.allowed.test")
            .header("X-Forwarded-Proto", "http")
            .header("X-Forwarded-Host", "target.local")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(server_state(config.clone()), by_host).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let wrong_host = HttpRequest::get("/x")
            .header("Host", "evil.test")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(server_state(config), wrong_host).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allow_list_also_gates_the_upgrade_endpoint() {
        let config = Config {
            white_list: vec!["10.0.0.".to_string()],
            ..Config::default()
        };

        let denied = with_remote(
            HttpRequest::get(WS_PATH).body(Body::empty()).unwrap(),
            [203, 0, 113, 9],
        );
        let (status, _) = send(server_state(config.clone()), denied).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // A listed remote reaches the upgrade handler, which rejects this
        // plain GET for lacking upgrade headers — anything but a 403.
        let allowed = with_remote(
            HttpRequest::get(WS_PATH).body(Body::empty()).unwrap(),
            [10, 0, 0, 7],
        );
        let (status, _) = send(server_state(config), allowed).await;
        assert_ne!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn upgrade_endpoint_skips_only_the_secret_check() {
        let config = Config {
            secret: Some("s3cr3t".to_string()),
            ..Config::default()
        };

        // The guard 403s ordinary routes without X-Auth-SECRET...
        let (status, _) = send(
            server_state(config.clone()),
            HttpRequest::get("/x").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // ...but lets /_ws through to its own Authorization handshake; this
        // plain GET is then refused as a bad upgrade, not with a 403. The
        // wrong-Authorization dial rejection is covered end-to-end in
        // tests/tunnel.rs.
        let (status, _) = send(
            server_state(config),
            HttpRequest::get(WS_PATH).body(Body::empty()).unwrap(),
        )
        .await;
        assert_ne!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_proxy_type_header_is_rejected() {
        let state = server_state(Config::default());
        let request = HttpRequest::get("/x")
            .header("X-Proxy-Type", "carrier-pigeon")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn hop_by_hop_set_matches_the_contract() {
        for name in [
            "Content-Length",
            "Transfer-Encoding",
            "Connection",
            "Keep-Alive",
            "Proxy-Authenticate",
            "Proxy-Authorization",
            "TE",
            "Trailer",
            "Upgrade",
            "Sec-WebSocket-Accept",
            "Sec-WebSocket-Key",
            "Content-Encoding",
        ] {
            assert!(is_hop_by_hop(name), "{name} should be stripped");
        }
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-Request-Id"));
    }

    #[test]
    fn proxy_control_headers_are_stripped_from_forwards() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("t.local"));
        headers.insert("x-auth-secret", HeaderValue::from_static("s"));
        headers.insert("x-proxy-type", HeaderValue::from_static("wss"));
        headers.insert("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("text/html"));

        let collected = collect_request_headers(&headers);
        assert_eq!(collected.len(), 1);
        assert_eq!(
            collected.get("accept").map(Vec::len),
            Some(2),
            "multi-value headers keep every value"
        );
    }

    #[test]
    fn target_url_prefers_headers_over_config_defaults() {
        let config = Config {
            forwarded_proto: Some("https".to_string()),
            forwarded_host: Some("fallback.local".to_string()),
            ..Config::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-host", HeaderValue::from_static("a.local:9000"));
        let uri: Uri = "/echo?x=1".parse().unwrap();

        let url = target_url(ProxyMode::Wss, &headers, &uri, &config).unwrap();
        assert_eq!(url, "https://a.local:9000/echo?x=1");

        let url = target_url(ProxyMode::Wss, &HeaderMap::new(), &uri, &config).unwrap();
        assert_eq!(url, "https://fallback.local/echo?x=1");

        let bare = Config::default();
        assert!(target_url(ProxyMode::Wss, &HeaderMap::new(), &uri, &bare).is_err());
    }

    #[test]
    fn server_mode_joins_the_configured_upstream() {
        let config = Config {
            server_url: Some("http://upstream.local:9000/".to_string()),
            ..Config::default()
        };
        let uri: Uri = "/v1/items?page=2".parse().unwrap();
        let url = target_url(ProxyMode::Server, &HeaderMap::new(), &uri, &config).unwrap();
        assert_eq!(url, "http://upstream.local:9000/v1/items?page=2");
    }

    #[test]
    fn envelope_response_strips_hop_by_hop_headers() {
        let envelope = HttpResponseEnvelope {
            status_code: 200,
            headers: HashMap::from([
                (
                    "Content-Type".to_string(),
                    vec!["text/plain".to_string()],
                ),
                ("Content-Length".to_string(), vec!["5".to_string()]),
                ("Connection".to_string(), vec!["close".to_string()]),
                (
                    "Sec-WebSocket-Accept".to_string(),
                    vec!["x".to_string()],
                ),
            ]),
            body: b"hello".to_vec(),
        };
        let response = envelope_response(envelope);
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("sec-websocket-accept").is_none());
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn secret_comparison_is_exact() {
        assert!(constant_time_eq("s3cr3t", "s3cr3t"));
        assert!(!constant_time_eq("s3cr3t", "s3cr3T"));
        assert!(!constant_time_eq("", "s3cr3t"));
    }
}
