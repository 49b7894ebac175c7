//! Admin HTTP surface.
//!
//! Two operations on a separate listener:
//! - `GET /apps` lists pooled instances as `name(version):port [state]`
//! - `POST /repo/tags/refresh` refreshes the catalog and reconciles
//!
//! Anything else is `404 Not found`.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::reconciler::Reconciler;

/// Operations the admin listener understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOperation {
    ListApps,
    RefreshTags,
}

impl AdminOperation {
    pub fn resolve(method: &Method, path: &str) -> Option<Self> {
        match (method, path) {
            (&Method::GET, "/apps") => Some(Self::ListApps),
            (&Method::POST, "/repo/tags/refresh") => Some(Self::RefreshTags),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AdminState {
    reconciler: Arc<Reconciler>,
}

impl AdminState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

async fn list_apps(state: &AdminState) -> Response {
    let mut body = String::new();
    for instance in state.reconciler.pool().snapshot().await {
        // Writing to a String cannot fail.
        let _ = writeln!(
            body,
            "{}({}):{} [{}]",
            instance.app(),
            instance.name(),
            instance.port(),
            instance.state()
        );
    }
    (StatusCode::OK, body).into_response()
}

async fn refresh_tags(state: &AdminState) -> Response {
    info!("Refreshing tags on request");
    match state.reconciler.refresh_and_reconcile().await {
        Ok(_) => (StatusCode::OK, "Tags refreshed").into_response(),
        Err(e) => {
            error!(error = %e, code = e.code(), "Failed to refresh tags");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn dispatch(State(state): State<AdminState>, req: Request) -> Response {
    match AdminOperation::resolve(req.method(), req.uri().path()) {
        Some(AdminOperation::ListApps) => list_apps(&state).await,
        Some(AdminOperation::RefreshTags) => refresh_tags(&state).await,
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// Router for the admin listener.
pub fn create_router(state: AdminState) -> axum::Router {
    axum::Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
