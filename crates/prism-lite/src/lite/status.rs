//! Status (server list ping) resolution: backend probing, per-backend ping cache with
//! single-flight loading, and the route's fallback response.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::lite::{
    codec::{self, Decoder},
    config::{FallbackStatus, Route},
    conn::ClientConn,
    error::LiteError,
    forward::try_backends,
    protocol::{Direction, Packet, PacketContext, State, StatusResponse},
    proxy::{Dialer, Proxy, read_packet},
};

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

pub type PingResult = Result<StatusResponse, Arc<LiteError>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PingKey {
    pub backend: String,
    pub protocol: i32,
}

#[derive(Debug)]
struct Entry {
    result: PingResult,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    items: Mutex<HashMap<PingKey, Entry>>,
    inflight: Mutex<HashMap<PingKey, watch::Receiver<Option<PingResult>>>>,
    // Bumped by `clear`; loaders started before a clear do not insert.
    generation: AtomicU64,
    loads: AtomicU64,
}

/// TTL cache of status results keyed by backend and protocol version. Errors are cached too.
#[derive(Debug, Clone, Default)]
pub struct PingCache {
    inner: Arc<Inner>,
}

impl PingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PingKey) -> Option<PingResult> {
        let mut items = self.inner.items.lock().unwrap_or_else(|e| e.into_inner());
        match items.get(key) {
            Some(e) if e.expires_at > Instant::now() => Some(e.result.clone()),
            Some(_) => {
                items.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: PingKey, result: PingResult, ttl: Duration) {
        let entry = Entry {
            result,
            expires_at: Instant::now() + ttl,
        };
        self.inner
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
    }

    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loader invocations so far.
    pub fn loads(&self) -> u64 {
        self.inner.loads.load(Ordering::Relaxed)
    }

    /// Returns the cached result for `key`, or runs `load` once for all concurrent callers.
    ///
    /// The loader runs on its own task, so cancelling `cancel` only abandons this waiter.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: PingKey,
        ttl: Duration,
        cancel: &CancellationToken,
        load: F,
    ) -> Result<StatusResponse, LiteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StatusResponse, LiteError>> + Send + 'static,
    {
        if let Some(res) = self.get(&key) {
            return res.map_err(LiteError::Shared);
        }

        let mut rx = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            // A loader may have finished between the fast path and taking the lock.
            if let Some(res) = self.get(&key) {
                return res.map_err(LiteError::Shared);
            }
            match inflight.get(&key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx.clone());
                    self.spawn_loader(key.clone(), ttl, tx, load());
                    rx
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(LiteError::ClientCancelled { during: "waiting for status" }),
            res = rx.wait_for(Option::is_some) => match res {
                Ok(v) => match &*v {
                    Some(res) => res.clone().map_err(LiteError::Shared),
                    None => Err(LiteError::LoaderAborted),
                },
                Err(_) => Err(LiteError::LoaderAborted),
            },
        }
    }

    fn spawn_loader<Fut>(
        &self,
        key: PingKey,
        ttl: Duration,
        tx: watch::Sender<Option<PingResult>>,
        fut: Fut,
    ) where
        Fut: Future<Output = Result<StatusResponse, LiteError>> + Send + 'static,
    {
        self.inner.loads.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.generation.load(Ordering::Acquire);
        let guard = InflightGuard {
            cache: self.clone(),
            key,
        };
        tokio::spawn(async move {
            let res = fut.await.map_err(Arc::new);
            let cache = &guard.cache;
            if cache.inner.generation.load(Ordering::Acquire) == generation {
                cache.insert(guard.key.clone(), res.clone(), ttl);
            }
            drop(guard);
            let _ = tx.send(Some(res));
        });
    }
}

/// Removes the in-flight marker even if the loader panics.
struct InflightGuard {
    cache: PingCache,
    key: PingKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.cache
            .inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

impl Proxy {
    /// Produces the status response for a client that sent `request` after `handshake`.
    ///
    /// Backends are tried in strategy order; when all fail and the route has a fallback,
    /// the fallback is encoded instead of returning the error.
    pub async fn resolve_status_response<C>(
        &self,
        client: &C,
        handshake: &PacketContext,
        request: &PacketContext,
    ) -> Result<StatusResponse, LiteError>
    where
        C: ClientConn + ?Sized,
    {
        let Some(hs) = handshake.handshake() else {
            return Err(LiteError::UnexpectedPacket {
                got: handshake.describe(),
                expected: "Handshake",
            });
        };
        let client_addr = client.remote_addr();
        let target = self.resolve_target(hs, client_addr)?;
        let route = &target.matched.route;

        let protocol = hs.protocol_version;

        let res = try_backends(self.backend_iter(&target), |backend| {
            self.status_from_backend(client, route, backend, protocol, handshake, request)
        })
        .await;

        match (res, &route.fallback) {
            (Ok(status), _) => Ok(status),
            (Err(err @ LiteError::ClientCancelled { .. }), _) => Err(err),
            (Err(err), Some(fallback)) => {
                tracing::info!(error = %err, "lite: failed to resolve status response, will use fallback");
                let load = (route.max_connections > 0).then(|| RouteLoad {
                    max: route.max_connections,
                    online: self.strategies().route_connection_count(route.connection_key()),
                });
                let status = fallback_status_json(fallback, protocol, load)?;
                tracing::debug!(status = %status, "lite: using fallback status response");
                Ok(StatusResponse { status })
            }
            (Err(err), None) => Err(err),
        }
    }

    async fn status_from_backend<C>(
        &self,
        client: &C,
        route: &Arc<Route>,
        backend: String,
        protocol: i32,
        handshake: &PacketContext,
        request: &PacketContext,
    ) -> Result<StatusResponse, LiteError>
    where
        C: ClientConn + ?Sized,
    {
        let dialer = self.dialer();
        let timeout = self.settings().status_timeout;
        let client_addr = client.remote_addr();

        if !route.cache_ping.enabled {
            return load_status(
                &dialer,
                client.cancellation(),
                client_addr,
                route,
                &backend,
                protocol,
                handshake,
                request,
                timeout,
            )
            .await;
        }

        let key = PingKey {
            backend: backend.clone(),
            protocol,
        };
        let load = {
            let route = route.clone();
            let handshake = handshake.clone();
            let request = request.clone();
            let cancel = self.shutdown_token().child_token();
            move || async move {
                load_status(
                    &dialer,
                    &cancel,
                    client_addr,
                    &route,
                    &backend,
                    protocol,
                    &handshake,
                    &request,
                    timeout,
                )
                .await
            }
        };
        self.ping_cache
            .get_or_load(key, route.cache_ping.ttl, client.cancellation(), load)
            .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn load_status(
    dialer: &Dialer,
    cancel: &CancellationToken,
    client_addr: SocketAddr,
    route: &Route,
    backend: &str,
    protocol: i32,
    handshake: &PacketContext,
    request: &PacketContext,
    timeout: Duration,
) -> Result<StatusResponse, LiteError> {
    tracing::debug!(backend, "lite: resolving status");
    let dialed = dialer
        .dial_route(cancel, client_addr, route, backend, handshake)
        .await?;
    fetch_status(
        dialed.stream,
        &dialed.backend,
        protocol,
        request,
        cancel,
        timeout,
    )
    .await
}

/// Sends the status request over an already handshaken backend connection and reads the
/// response. Bytes after the response are ignored.
pub(crate) async fn fetch_status<S>(
    mut conn: S,
    backend: &str,
    protocol: i32,
    request: &PacketContext,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<StatusResponse, LiteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    codec::write_frame(&mut conn, &request.payload)
        .await
        .map_err(|source| LiteError::BackendIo {
            backend: backend.to_string(),
            stage: "write status request",
            source,
        })?;

    let mut dec = Decoder::new(conn, Direction::Clientbound);
    dec.set_protocol(protocol);
    dec.set_state(State::Status);
    let ctx = read_packet(&mut dec, cancel, timeout, "reading backend status").await?;
    match ctx.packet {
        Some(Packet::StatusResponse(res)) => Ok(res),
        _ => Err(LiteError::UnexpectedPacket {
            got: ctx.describe(),
            expected: "StatusResponse",
        }),
    }
}

/// Live forward count of a route with a connection limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLoad {
    pub max: u32,
    pub online: u64,
}

/// Encodes `fallback` as a status document. A version protocol of 0 echoes the client's.
/// `load`, when given, replaces the configured player counts.
pub fn fallback_status_json(
    fallback: &FallbackStatus,
    client_protocol: i32,
    load: Option<RouteLoad>,
) -> Result<String, serde_json::Error> {
    let protocol = match fallback.version.protocol {
        0 => client_protocol,
        p => p,
    };
    let mut players = match &fallback.players {
        Some(p) => {
            let sample: Vec<Value> = p
                .sample
                .iter()
                .map(|s| {
                    let id = if s.id.is_empty() { NIL_UUID } else { s.id.as_str() };
                    json!({ "name": s.name, "id": id })
                })
                .collect();
            let mut players = json!({ "max": p.max, "online": p.online });
            if !sample.is_empty() {
                players["sample"] = Value::Array(sample);
            }
            players
        }
        None => json!({ "max": 0, "online": 0 }),
    };
    if let Some(load) = load {
        players["max"] = json!(load.max);
        players["online"] = json!(load.online);
    }
    let doc = json!({
        "version": { "name": fallback.version.name, "protocol": protocol },
        "players": players,
        "description": fallback.motd.clone().unwrap_or_else(|| Value::String(String::new())),
    });
    serde_json::to_string(&doc)
}
