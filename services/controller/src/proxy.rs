//! Application traffic routing.
//!
//! Every request on the proxy listener goes to one `Running` instance:
//! - the last instance routed to, if it is still pooled and `Running`
//! - otherwise the first `Running` instance in pool insertion order
//!
//! The chosen instance is re-validated on every request; a cached instance
//! that has stopped is never forwarded to. Bodies stream in both directions
//! and protocol upgrades are spliced through to the backend.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    body::{Body, HttpBody as _},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bisq_reconcile::LifecycleState;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::instance::AppInstance;
use crate::pool::InstancePool;

/// Headers that describe a single connection and are never forwarded as-is.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    NoBackend(#[from] ControllerError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("invalid upstream response: {0}")]
    Response(#[from] axum::http::Error),

    #[error("upstream switched protocols without an upgrade request")]
    UnexpectedUpgrade,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::NoBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) | ProxyError::Response(_) | ProxyError::UnexpectedUpgrade => {
                StatusCode::BAD_GATEWAY
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Picks the instance a request is forwarded to.
pub struct ProxyRouter {
    pool: Arc<InstancePool>,
    cached: Mutex<Option<Arc<AppInstance>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProxyRouter {
    pub fn new(pool: Arc<InstancePool>) -> Self {
        Self {
            pool,
            cached: Mutex::new(None),
        }
    }

    pub async fn select(&self) -> Result<Arc<AppInstance>, ControllerError> {
        let cached = lock(&self.cached).clone();
        if let Some(instance) = cached {
            let running = instance.state() == LifecycleState::Running;
            if running && self.pool.contains(&instance).await {
                return Ok(instance);
            }
            debug!(version = %instance.name(), "Cached backend no longer running");
        }

        let found = self
            .pool
            .snapshot()
            .await
            .into_iter()
            .find(|i| i.state() == LifecycleState::Running);

        *lock(&self.cached) = found.clone();
        match found {
            Some(instance) => {
                debug!(version = %instance.name(), port = instance.port(), "Selected backend");
                Ok(instance)
            }
            None => Err(ControllerError::NoBackendAvailable),
        }
    }
}

#[derive(Clone)]
pub struct ProxyState {
    router: Arc<ProxyRouter>,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(router: Arc<ProxyRouter>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { router, client })
    }

    async fn forward(&self, req: Request) -> Result<Response, ProxyError> {
        let instance = self.router.select().await?;
        let target = instance
            .proxy_target()
            .ok_or(ControllerError::NoBackendAvailable)?;

        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{target}{path}");

        let client_upgrade = if is_upgrade(&parts.headers) {
            parts.extensions.remove::<OnUpgrade>()
        } else {
            None
        };

        let mut upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(strip_hop_by_hop(parts.headers, client_upgrade.is_some()));
        if !body.is_end_stream() {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = upstream.send().await.inspect_err(|e| {
            warn!(version = %instance.name(), url = %url, error = %e, "Upstream request failed")
        })?;

        let status = upstream.status();
        let switching = status == StatusCode::SWITCHING_PROTOCOLS;
        let mut response = axum::http::Response::builder().status(status);
        if let Some(headers) = response.headers_mut() {
            *headers = strip_hop_by_hop(upstream.headers().clone(), switching);
        }

        if switching {
            let client = client_upgrade.ok_or(ProxyError::UnexpectedUpgrade)?;
            tokio::spawn(tunnel(instance.name().to_string(), client, upstream));
            return Ok(response.body(Body::empty())?);
        }

        Ok(response.body(Body::from_stream(upstream.bytes_stream()))?)
    }
}

/// Whether the request asks to switch protocols (e.g. websockets).
fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Drop hop-by-hop headers. With `upgrade`, the `Upgrade` header survives and
/// `Connection: upgrade` is restored.
fn strip_hop_by_hop(mut headers: HeaderMap, upgrade: bool) -> HeaderMap {
    let protocol = upgrade.then(|| headers.get(header::UPGRADE).cloned()).flatten();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    if let Some(protocol) = protocol {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
    headers
}

/// Splice an upgraded client connection onto the backend's.
async fn tunnel(version: String, client: OnUpgrade, upstream: reqwest::Response) {
    let (mut client, mut backend) = match tokio::join!(client, upstream.upgrade()) {
        (Ok(client), Ok(backend)) => (TokioIo::new(client), backend),
        (Err(e), _) => {
            warn!(version = %version, error = %e, "Client upgrade failed");
            return;
        }
        (_, Err(e)) => {
            warn!(version = %version, error = %e, "Upstream upgrade failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((sent, received)) => {
            debug!(version = %version, sent, received, "Upgraded connection closed")
        }
        Err(e) => debug!(version = %version, error = %e, "Upgraded connection ended"),
    }
}

async fn forward(State(state): State<ProxyState>, req: Request) -> Response {
    match state.forward(req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Router for the proxy listener. Every path is forwarded.
pub fn create_router(state: ProxyState) -> axum::Router {
    axum::Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
