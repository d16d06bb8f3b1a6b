//! Local offline proxy.
//!
//! Browsers talk to the proxy; the proxy runs every request through a
//! [`ServiceWorker`] whose network is the upstream origin. This makes the
//! worker's cache policy available to any client without browser support.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use reqwest::Url;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::network::Network;
use crate::request::{Request, RequestMode};
use crate::response::Response;
use crate::stats::StatsSnapshot;
use crate::storage::CacheStorage;
use crate::worker::ServiceWorker;

/// Path of the proxy's own status endpoint.
pub const STATUS_PATH: &str = "/__offline-shell/status";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

struct ProxyState<S, N> {
    worker: Arc<ServiceWorker<S, N>>,
    upstream: Url,
}

impl<S, N> Clone for ProxyState<S, N> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            upstream: self.upstream.clone(),
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    cache: String,
    state: String,
    clients: usize,
    stats: StatsSnapshot,
}

/// Derives the request mode from fetch metadata headers.
///
/// Uses `Sec-Fetch-Mode` when present; otherwise a `GET` that accepts HTML
/// is treated as a navigation.
#[must_use]
pub fn request_mode(method: &Method, headers: &HeaderMap) -> RequestMode {
    if let Some(mode) = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
        return match mode {
            "navigate" => RequestMode::Navigate,
            "same-origin" => RequestMode::SameOrigin,
            "cors" => RequestMode::Cors,
            _ => RequestMode::NoCors,
        };
    }
    let accepts_html = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));
    if *method == Method::GET && accepts_html {
        RequestMode::Navigate
    } else {
        RequestMode::NoCors
    }
}

/// Builds the upstream request for an incoming proxy request.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if the method is not a valid HTTP method.
pub fn upstream_request(
    upstream: &Url,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request> {
    // Copied, not joined: a `//host/...` path must stay on the upstream.
    let mut url = upstream.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    let mode = request_mode(method, headers);
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| Error::InvalidUrl(format!("method {method}: {e}")))?;

    let mut request = Request::new(method, url).with_mode(mode);
    request.headers = headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    request.body = body;
    Ok(request)
}

fn into_http(res: Response) -> axum::response::Response {
    let status = StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = axum::response::Response::new(Body::from(res.body));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    for (name, value) in &res.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    out
}

async fn handle<S: CacheStorage, N: Network>(
    State(state): State<ProxyState<S, N>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let request = match upstream_request(&state.upstream, &method, &uri, &headers, body) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match state.worker.fetch(request).await {
        Ok(res) => into_http(res),
        Err(e) => {
            log::warn!("{method} {uri} failed: {e}");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

async fn status<S: CacheStorage, N: Network>(
    State(state): State<ProxyState<S, N>>,
) -> impl IntoResponse {
    let worker = &state.worker;
    axum::Json(StatusResponse {
        cache: worker.manager().config().cache_name(),
        state: worker.state().to_string(),
        clients: worker.clients().len(),
        stats: worker.manager().stats().snapshot(),
    })
}

/// Builds the proxy router.
pub fn router<S: CacheStorage, N: Network>(
    worker: Arc<ServiceWorker<S, N>>,
    upstream: Url,
) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status::<S, N>))
        .fallback(handle::<S, N>)
        .with_state(ProxyState { worker, upstream })
}

/// Binds `host:port` and serves the proxy until the server stops.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn serve<S: CacheStorage, N: Network>(
    worker: Arc<ServiceWorker<S, N>>,
    upstream: Url,
    host: &str,
    port: u16,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("bind address {host}:{port}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Proxying {upstream} on http://{addr}");
    axum::serve(listener, router(worker, upstream)).await?;
    Ok(())
}
