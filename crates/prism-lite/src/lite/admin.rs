use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lite::{
    proxy::Proxy,
    registry::ActiveForward,
    telemetry::{self, ReloadSignal, SharedPrometheusHandle},
};

pub struct AdminState {
    pub proxy: Arc<Proxy>,
    /// `None` when no recorder was installed; `/metrics` then answers 404.
    pub prometheus: Option<SharedPrometheusHandle>,
    pub config_path: PathBuf,
    pub reload_tx: watch::Sender<ReloadSignal>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/routes", get(routes))
        .route("/forwards", get(forwards))
        .route("/forwards/{id}", get(forward_by_id))
        .route("/reload", post(reload))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(addr: &str, state: AdminState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("admin: local addr")?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("admin: serve")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    routes: usize,
    active_forwards: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let rt = st.proxy.runtime();
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            routes: st.proxy.router().routes().len(),
            active_forwards: rt.forwards().len(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> Response {
    match &st.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct RouteView {
    hosts: Vec<String>,
    backends: Vec<String>,
    strategy: String,
    proxy_protocol: bool,
    tcp_shield_real_ip: bool,
    modify_virtual_host: bool,
    cache_ping: bool,
    cache_ping_ttl_ms: u64,
    fallback: bool,
    max_connections: u32,
    connections: u64,
}

async fn routes(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let views: Vec<RouteView> = st
        .proxy
        .router()
        .routes()
        .iter()
        .map(|r| RouteView {
            hosts: r.hosts.clone(),
            backends: r.backends.clone(),
            strategy: r.strategy.to_string(),
            proxy_protocol: r.proxy_protocol,
            tcp_shield_real_ip: r.tcp_shield_real_ip,
            modify_virtual_host: r.modify_virtual_host,
            cache_ping: r.cache_ping.enabled,
            cache_ping_ttl_ms: r.cache_ping.ttl.as_millis() as u64,
            fallback: r.fallback.is_some(),
            max_connections: r.max_connections,
            connections: st
                .proxy
                .strategies()
                .route_connection_count(r.connection_key()),
        })
        .collect();
    (StatusCode::OK, Json(views))
}

#[derive(Debug, Serialize)]
struct ForwardView {
    connection_id: String,
    client_ip: Option<IpAddr>,
    client_addr: String,
    backend_addr: String,
    host: String,
    route: String,
    started_at_unix_ms: u64,
}

impl From<ActiveForward> for ForwardView {
    fn from(f: ActiveForward) -> Self {
        Self {
            connection_id: f.connection_id,
            client_ip: f.client_ip,
            client_addr: f.client_addr.to_string(),
            backend_addr: f.backend_addr.to_string(),
            host: f.host,
            route: f.route_id,
            started_at_unix_ms: telemetry::unix_ms(f.started_at),
        }
    }
}

fn views(forwards: Vec<ActiveForward>) -> Json<Vec<ForwardView>> {
    Json(forwards.into_iter().map(ForwardView::from).collect())
}

#[derive(Debug, Deserialize)]
struct ForwardsQuery {
    ip: Option<String>,
}

async fn forwards(
    State(st): State<Arc<AdminState>>,
    Query(q): Query<ForwardsQuery>,
) -> Response {
    let tracker = st.proxy.runtime().forwards();
    match q.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => (StatusCode::OK, views(tracker.list())).into_response(),
        Some(raw) => match raw.parse::<IpAddr>() {
            Ok(ip) => (StatusCode::OK, views(tracker.list_by_client_ip(ip))).into_response(),
            Err(_) => (StatusCode::BAD_REQUEST, format!("invalid ip {raw:?}")).into_response(),
        },
    }
}

async fn forward_by_id(State(st): State<Arc<AdminState>>, Path(id): Path<String>) -> Response {
    match st.proxy.runtime().forwards().get(&id) {
        Some(fwd) => (StatusCode::OK, Json(ForwardView::from(fwd))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    seq: u64,
    config_path: String,
}

async fn reload(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let mut next = st.reload_tx.borrow().clone();
    next.next();
    let seq = next.seq;

    // Nobody may be listening when reload is disabled.
    let _ = st.reload_tx.send(next);

    (
        StatusCode::OK,
        Json(ReloadResponse {
            seq,
            config_path: st.config_path.display().to_string(),
        }),
    )
}
