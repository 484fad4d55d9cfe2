use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::lite::{
    backend::BackendIterator,
    blacklist::Blacklist,
    codec::{self, CodecError, Decoder, Encoder},
    config::{Config, Route},
    conn::{BufferedConn, ClientConn},
    error::LiteError,
    net,
    protocol::{Direction, Handshake, Packet, PacketContext, State},
    proxy_protocol::ProxyHeader,
    router::{RouteMatch, Router},
    runtime::Runtime,
    status::PingCache,
    strategy::StrategyManager,
    vhost,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySettings {
    pub dial_timeout: Duration,
    /// Bound on reading the handshake after accepting a connection.
    pub handshake_timeout: Duration,
    /// Bound on each status-phase read, on both the client and the backend side.
    pub status_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for ProxySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            dial_timeout: cfg.dial_timeout,
            handshake_timeout: cfg.timeouts.handshake,
            status_timeout: cfg.timeouts.status,
        }
    }
}

/// The Lite proxy: routing table, selection state, ping cache and observability runtime.
///
/// Connections accepted by [`serve_tcp_with_shutdown`] are served through
/// [`Proxy::handle_conn`]; embedders that decode the handshake themselves call
/// [`Proxy::forward`] or [`Proxy::resolve_status_response`] directly.
#[derive(Debug)]
pub struct Proxy {
    router: Router,
    strategies: Arc<StrategyManager>,
    runtime: Arc<Runtime>,
    pub(crate) ping_cache: PingCache,
    blacklist: Arc<Blacklist>,
    settings: ArcSwap<ProxySettings>,
    shutdown: CancellationToken,
}

/// A route resolved for one client.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub matched: RouteMatch,
    pub host: String,
    pub client_ip: IpAddr,
}

/// A backend connection that has already received the PROXY header (if any) and the handshake.
#[derive(Debug)]
pub(crate) struct Dialed {
    pub stream: TcpStream,
    pub backend: String,
    pub backend_addr: SocketAddr,
}

impl Proxy {
    pub fn new(routes: Vec<Route>, settings: ProxySettings) -> Self {
        Self {
            router: Router::new(routes),
            strategies: Arc::new(StrategyManager::new()),
            runtime: Arc::new(Runtime::new()),
            ping_cache: PingCache::new(),
            blacklist: Arc::new(Blacklist::new()),
            settings: ArcSwap::from_pointee(settings),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<Runtime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Arc<Blacklist>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_strategies(mut self, strategies: Arc<StrategyManager>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Root token; every accepted connection gets a child of it.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn strategies(&self) -> &Arc<StrategyManager> {
        &self.strategies
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn settings(&self) -> ProxySettings {
        **self.settings.load()
    }

    pub fn update_settings(&self, settings: ProxySettings) {
        self.settings.store(Arc::new(settings));
    }

    /// Swaps the routing table. Cached pings are dropped since TTLs and fallbacks may differ.
    pub fn update_routes(&self, routes: Vec<Route>) {
        self.router.update(routes);
        self.reset_ping_cache();
    }

    pub fn reset_ping_cache(&self) {
        self.ping_cache.clear();
    }

    pub(crate) fn resolve_target(
        &self,
        handshake: &Handshake,
        remote: SocketAddr,
    ) -> Result<Target, LiteError> {
        let host = vhost::clear_virtual_host(&handshake.server_address);
        let matched = self
            .router
            .find_route(&host)
            .ok_or_else(|| LiteError::RouteNotFound { host: host.clone() })?;
        tracing::Span::current().record("route", matched.pattern.as_str());

        if matched.backends.is_empty() {
            return Err(LiteError::NoBackendConfigured {
                route: matched.pattern.clone(),
            });
        }

        let client_ip = vhost::effective_client_ip(
            &handshake.server_address,
            remote,
            matched.route.tcp_shield_real_ip,
        );
        if self.blacklist.contains(&client_ip) || matched.route.is_blacklisted(&client_ip) {
            return Err(LiteError::Blacklisted {
                ip: client_ip,
                route: matched.pattern.clone(),
            });
        }

        Ok(Target {
            matched,
            host,
            client_ip,
        })
    }

    pub(crate) fn backend_iter(&self, target: &Target) -> BackendIterator {
        BackendIterator::new(
            self.strategies.clone(),
            target.matched.route.strategy,
            target.matched.pattern.clone(),
            &target.matched.backends,
        )
    }

    pub(crate) fn dialer(&self) -> Dialer {
        Dialer {
            timeout: self.settings().dial_timeout,
            strategies: self.strategies.clone(),
        }
    }

    /// Serves one accepted connection until it is forwarded, answered or rejected.
    pub async fn handle_conn(&self, stream: TcpStream) {
        metrics::counter!("lite_connections_total").increment(1);
        let _ = stream.set_nodelay(true);

        let cancel = self.shutdown.child_token();
        let conn = match BufferedConn::from_tcp(stream, cancel.clone()) {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(error = %err, "lite: dropping connection without peer address");
                return;
            }
        };
        let peer = conn.remote_addr();

        let mut dec = Decoder::new(conn, Direction::Serverbound);
        let handshake_timeout = self.settings().handshake_timeout;
        let mut hs_ctx = match read_packet(&mut dec, &cancel, handshake_timeout, "reading handshake").await {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::debug!(client = %peer, error = %err, "lite: failed to read handshake");
                return;
            }
        };
        let Some(hs) = hs_ctx.handshake().cloned() else {
            tracing::debug!(client = %peer, packet = %hs_ctx.describe(), "lite: first packet is not a handshake");
            return;
        };
        // Everything after the handshake speaks the client's protocol version.
        hs_ctx.protocol = hs.protocol_version;
        dec.set_protocol(hs.protocol_version);

        let span = tracing::info_span!(
            "lite",
            client = %peer.ip(),
            virtual_host = %vhost::clear_virtual_host(&hs.server_address),
            protocol = hs.protocol_version,
            route = tracing::field::Empty,
        );

        async {
            let res = match hs.next_state {
                Handshake::NEXT_STATE_STATUS => self.serve_status(dec, &cancel, hs_ctx).await,
                Handshake::NEXT_STATE_LOGIN | Handshake::NEXT_STATE_TRANSFER => {
                    let (conn, read_ahead) = dec.into_parts();
                    self.forward(conn.with_buffered(read_ahead), hs_ctx).await
                }
                other => Err(LiteError::UnexpectedPacket {
                    got: format!("Handshake(next_state={other})"),
                    expected: "next state 1, 2 or 3",
                }),
            };
            if let Err(err) = res {
                err.log("lite: connection ended with error");
            }
        }
        .instrument(span)
        .await;

        cancel.cancel();
    }

    async fn serve_status(
        &self,
        mut dec: Decoder<BufferedConn<TcpStream>>,
        cancel: &CancellationToken,
        hs_ctx: PacketContext,
    ) -> Result<(), LiteError> {
        let timeout = self.settings().status_timeout;
        dec.set_state(State::Status);
        dec.set_protocol(hs_ctx.protocol);

        let req = read_packet(&mut dec, cancel, timeout, "reading status request").await?;
        if !matches!(req.packet, Some(Packet::StatusRequest)) {
            return Err(LiteError::UnexpectedPacket {
                got: req.describe(),
                expected: "StatusRequest",
            });
        }
        metrics::counter!("lite_status_requests_total").increment(1);

        let res = {
            let conn = dec.get_ref();
            let resolve = self.resolve_status_response(conn, &hs_ctx, &req);
            tokio::pin!(resolve);
            tokio::select! {
                res = &mut resolve => res,
                _ = client_gone(conn.get_ref()) => {
                    tracing::debug!("lite: client closed while waiting for status");
                    cancel.cancel();
                    resolve.await
                }
            }
        }?;
        Encoder::new(dec.get_mut())
            .write_packet(&Packet::StatusResponse(res))
            .await?;

        // Clients may skip the ping and just close.
        match read_packet(&mut dec, cancel, timeout, "reading status ping").await {
            Ok(PacketContext {
                packet: Some(Packet::StatusPing(payload)),
                ..
            }) => {
                Encoder::new(dec.get_mut())
                    .write_packet(&Packet::StatusPong(payload))
                    .await?;
            }
            Ok(other) => {
                tracing::debug!(packet = %other.describe(), "lite: ignoring packet after status response");
            }
            Err(err) => tracing::debug!(error = %err, "lite: no status ping"),
        }
        Ok(())
    }
}

/// Resolves once the client has hung up. Pending input parks it; a close behind that input
/// is noticed by the next read instead.
async fn client_gone(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Opens backend connections on behalf of the forward and status paths.
#[derive(Debug, Clone)]
pub(crate) struct Dialer {
    pub timeout: Duration,
    pub strategies: Arc<StrategyManager>,
}

impl Dialer {
    /// Connects to `backend`, then writes the optional PROXY header and the (possibly
    /// rewritten) handshake.
    pub async fn dial_route(
        &self,
        cancel: &CancellationToken,
        client_addr: SocketAddr,
        route: &Route,
        backend: &str,
        handshake: &PacketContext,
    ) -> Result<Dialed, LiteError> {
        let timeout = self.timeout;
        let started = Instant::now();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(LiteError::ClientCancelled { during: "dialing backend" });
            }
            res = tokio::time::timeout(timeout, TcpStream::connect(backend)) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(LiteError::Dial { backend: backend.to_string(), source });
                }
                Err(_) => {
                    return Err(LiteError::Dial {
                        backend: backend.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("dial timed out after {timeout:?}"),
                        ),
                    });
                }
            },
        };
        self.strategies.record_latency(backend, started.elapsed());
        let _ = stream.set_nodelay(true);

        let io_err = |stage: &'static str| {
            move |source: io::Error| LiteError::BackendIo {
                backend: backend.to_string(),
                stage,
                source,
            }
        };

        let backend_addr = stream.peer_addr().map_err(io_err("read peer address"))?;

        if route.proxy_protocol {
            ProxyHeader::new(client_addr, backend_addr)
                .write_to(&mut stream)
                .await
                .map_err(io_err("write proxy protocol header"))?;
        }

        let handshake = rewrite_handshake(route, backend, client_addr, handshake);
        codec::write_frame(&mut stream, &handshake.payload)
            .await
            .map_err(io_err("write handshake"))?;

        Ok(Dialed {
            stream,
            backend: backend.to_string(),
            backend_addr,
        })
    }
}

/// Applies the route's handshake rewrites for `backend`. The original is never mutated so
/// each failover attempt starts from the client's handshake.
pub(crate) fn rewrite_handshake(
    route: &Route,
    backend: &str,
    client_addr: SocketAddr,
    ctx: &PacketContext,
) -> PacketContext {
    let mut ctx = ctx.clone();
    let Some(mut hs) = ctx.handshake().cloned() else {
        return ctx;
    };

    let mut changed = false;
    if route.modify_virtual_host {
        if let Some(addr) = vhost::modify_virtual_host(&hs.server_address, net::host_str(backend)) {
            hs.server_address = addr;
            changed = true;
        }
    }
    if route.tcp_shield_real_ip && vhost::is_tcpshield_real_ip(&hs.server_address) {
        hs.server_address =
            vhost::tcpshield_rewrite(&hs.server_address, client_addr, SystemTime::now());
        changed = true;
    }
    if changed {
        ctx.update_handshake(hs);
    }
    ctx
}

/// Decodes one packet under `timeout`, accepting trailing bytes. Cancellation wins.
pub(crate) async fn read_packet<R: AsyncRead + Unpin>(
    dec: &mut Decoder<R>,
    cancel: &CancellationToken,
    timeout: Duration,
    during: &'static str,
) -> Result<PacketContext, LiteError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LiteError::ClientCancelled { during }),
        res = tokio::time::timeout(timeout, dec.decode()) => match res {
            Ok(res) => Ok(codec::accept_left_bytes(res)?),
            Err(_) => Err(CodecError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {timeout:?} while {during}"),
            ))
            .into()),
        },
    }
}

/// Accepts connections on `listen_addr` until the proxy's shutdown token is cancelled.
/// Connection tasks are spawned on `tracker` so the caller can drain them.
pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    proxy: Arc<Proxy>,
    tracker: TaskTracker,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;
    serve_listener(ln, proxy, tracker).await
}

pub async fn serve_listener(
    ln: TcpListener,
    proxy: Arc<Proxy>,
    tracker: TaskTracker,
) -> anyhow::Result<()> {
    let local = ln.local_addr().context("tcp: local addr")?;
    tracing::info!(listen_addr = %local, "tcp: listening");

    let shutdown = proxy.shutdown_token().clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(error = %err, "tcp: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let proxy = proxy.clone();
                tracker.spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "tcp: accepted");
                    }
                    proxy.handle_conn(conn).await;
                });
            }
        }
    }

    tracing::info!(listen_addr = %local, "tcp: listener stopped");
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::Notify,
    };

    use super::{test_util::*, *};
    use crate::lite::{
        config::FallbackStatus,
        protocol::StatusResponse,
    };

    fn ctx(addr: &str) -> PacketContext {
        PacketContext::from_packet(
            Direction::Serverbound,
            765,
            Packet::Handshake(handshake(addr, 765, 2)),
        )
    }

    #[test]
    fn rewrite_modifies_virtual_host_for_backend() {
        let mut route = Route::new(["*.example.com"], ["backend.local:25566"]);
        route.modify_virtual_host = true;
        let client: SocketAddr = "203.0.113.2:51000".parse().expect("addr");

        let out = rewrite_handshake(&route, "backend.local:25566", client, &ctx("Play.Example.com\0FML2\0"));
        assert_eq!(
            out.handshake().expect("hs").server_address,
            "backend.local\0FML2\0"
        );
        assert_ne!(out.payload, ctx("Play.Example.com\0FML2\0").payload);

        let same = rewrite_handshake(&route, "backend.local:1", client, &ctx("backend.local"));
        assert_eq!(same.payload, ctx("backend.local").payload);
    }

    #[test]
    fn rewrite_refreshes_tcpshield_address() {
        let mut route = Route::new(["*.example.com"], ["10.0.0.1:25565"]);
        route.tcp_shield_real_ip = true;
        let client: SocketAddr = "203.0.113.2:51000".parse().expect("addr");

        let out = rewrite_handshake(
            &route,
            "10.0.0.1:25565",
            client,
            &ctx("play.example.com///198.51.100.5:41234///1700000000"),
        );
        let addr = &out.handshake().expect("hs").server_address;
        assert!(addr.starts_with("play.example.com///203.0.113.2:51000///"), "{addr}");

        let plain = rewrite_handshake(&route, "10.0.0.1:25565", client, &ctx("play.example.com"));
        assert_eq!(plain.handshake().expect("hs").server_address, "play.example.com");
    }

    #[test]
    fn resolve_target_errors() {
        let mut blocked = Route::new(["blocked.example.com"], ["10.0.0.1:1"]);
        blocked.blacklist = vec!["198.51.100.9".parse().expect("ip")];
        let proxy = Proxy::new(
            vec![
                Route::new(["empty.example.com"], Vec::<String>::new()),
                blocked,
                Route::new(["*.example.com"], ["10.0.0.2:1"]),
            ],
            ProxySettings::default(),
        )
        .with_blacklist(Arc::new(Blacklist::from_ips(["198.51.100.66".parse().expect("ip")])));
        let remote: SocketAddr = "198.51.100.9:5000".parse().expect("addr");

        let err = proxy
            .resolve_target(&handshake("nope.net", 765, 2), remote)
            .expect_err("no route");
        assert!(matches!(err, LiteError::RouteNotFound { ref host } if host == "nope.net"));
        assert_eq!(err.verbosity(), 1);

        let err = proxy
            .resolve_target(&handshake("empty.example.com", 765, 2), remote)
            .expect_err("no backend");
        assert!(matches!(err, LiteError::NoBackendConfigured { .. }));

        let err = proxy
            .resolve_target(&handshake("blocked.example.com", 765, 2), remote)
            .expect_err("route blacklist");
        assert!(matches!(err, LiteError::Blacklisted { .. }));

        let banned: SocketAddr = "198.51.100.66:1".parse().expect("addr");
        let err = proxy
            .resolve_target(&handshake("a.example.com", 765, 2), banned)
            .expect_err("global blacklist");
        assert!(matches!(err, LiteError::Blacklisted { .. }));

        let t = proxy
            .resolve_target(&handshake("A.Example.com.", 765, 2), remote)
            .expect("target");
        assert_eq!(t.host, "a.example.com");
        assert_eq!(t.client_ip, remote.ip());
    }

    #[tokio::test]
    async fn dial_route_writes_proxy_header_then_handshake() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend_addr = backend_ln.local_addr().expect("addr");
        let mut route = Route::new(["*"], [backend_addr.to_string()]);
        route.proxy_protocol = true;

        let proxy = Proxy::new(vec![route.clone()], ProxySettings::default());
        let client: SocketAddr = "198.51.100.5:41000".parse().expect("addr");
        let hs = ctx("play.example.com");

        let accept = tokio::spawn(async move {
            let (mut s, _) = backend_ln.accept().await.expect("accept");
            let mut header = [0u8; 28];
            s.read_exact(&mut header).await.expect("header");
            let mut rest = Vec::new();
            s.read_to_end(&mut rest).await.expect("rest");
            (header, rest)
        });

        let dialed = proxy
            .dialer()
            .dial_route(&CancellationToken::new(), client, &route, &backend_addr.to_string(), &hs)
            .await
            .expect("dial");
        assert_eq!(dialed.backend_addr, backend_addr);
        drop(dialed);

        let (header, rest) = accept.await.expect("join");
        assert_eq!(&header[..], &ProxyHeader::new(client, backend_addr).encode()[..]);
        assert_eq!(rest, frame(&hs.payload));
        assert!(proxy.strategies().latency(&backend_addr.to_string()).is_some());
    }

    #[tokio::test]
    async fn dial_route_classifies_refusal_and_cancellation() {
        let proxy = Proxy::new(Vec::new(), ProxySettings::default());
        let addr = refused_addr().await.to_string();
        let route = Route::new(["*"], [addr.clone()]);
        let client: SocketAddr = "127.0.0.1:1".parse().expect("addr");

        let err = proxy
            .dialer()
            .dial_route(&CancellationToken::new(), client, &route, &addr, &ctx("x"))
            .await
            .expect_err("refused");
        assert!(matches!(err, LiteError::Dial { .. }));
        assert_eq!(err.verbosity(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = proxy
            .dialer()
            .dial_route(&cancel, client, &route, &addr, &ctx("x"))
            .await
            .expect_err("cancelled");
        assert!(matches!(err, LiteError::ClientCancelled { .. }));
    }

    #[tokio::test]
    async fn listener_answers_status_with_fallback_and_pong() {
        let dead = refused_addr().await;
        let mut route = Route::new(["*.example.com"], [dead.to_string()]);
        route.fallback = Some(FallbackStatus {
            motd: Some(serde_json::Value::String("Maintenance".into())),
            ..FallbackStatus::default()
        });
        let proxy = Arc::new(Proxy::new(vec![route], ProxySettings::default()));

        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let proxy_addr = ln.local_addr().expect("addr");
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve_listener(ln, proxy.clone(), tracker.clone()));

        let mut c = TcpStream::connect(proxy_addr).await.expect("connect");
        let mut out = handshake_frame("lobby.example.com", 765, 1);
        out.extend(packet_frame(&Packet::StatusRequest));
        out.extend(packet_frame(&Packet::StatusPing(99)));
        c.write_all(&out).await.expect("write");

        let mut dec = Decoder::new(&mut c, Direction::Clientbound);
        dec.set_state(State::Status);
        let resp = dec.decode().await.expect("status");
        let Some(Packet::StatusResponse(StatusResponse { status })) = resp.packet else {
            panic!("expected status response, got {}", resp.describe());
        };
        let doc: serde_json::Value = serde_json::from_str(&status).expect("json");
        assert_eq!(doc["description"], "Maintenance");
        assert_eq!(doc["version"]["protocol"], 765);

        let pong = dec.decode().await.expect("pong");
        assert!(matches!(pong.packet, Some(Packet::StatusPong(99))));

        proxy.shutdown_token().cancel();
        server.await.expect("join").expect("serve");
        tracker.close();
        tracker.wait().await;
    }

    /// Answers each status ping with the protocol version of its handshake. With a gate,
    /// every answer waits for one notification.
    async fn version_echo_backend(gate: Option<Arc<Notify>>) -> (SocketAddr, Arc<AtomicUsize>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                seen.fetch_add(1, Ordering::SeqCst);
                let gate = gate.clone();
                tokio::spawn(async move {
                    let mut dec = Decoder::new(&mut s, Direction::Serverbound);
                    let Ok(first) = dec.decode().await else {
                        return;
                    };
                    let Some(version) = first.handshake().map(|h| h.protocol_version) else {
                        return;
                    };
                    dec.set_state(State::Status);
                    let _ = codec::accept_left_bytes(dec.decode().await);
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    let status = format!("{{\"version\":{{\"protocol\":{version}}}}}");
                    let _ = s
                        .write_all(&packet_frame(&Packet::StatusResponse(StatusResponse { status })))
                        .await;
                });
            }
        });
        (addr, hits)
    }

    async fn start_listener(proxy: Arc<Proxy>) -> (SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>, TaskTracker) {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve_listener(ln, proxy, tracker.clone()));
        (addr, server, tracker)
    }

    async fn send_status_request(proxy_addr: SocketAddr, host: &str, version: i32) -> TcpStream {
        let mut c = TcpStream::connect(proxy_addr).await.expect("connect");
        let mut out = handshake_frame(host, version, 1);
        out.extend(packet_frame(&Packet::StatusRequest));
        c.write_all(&out).await.expect("write");
        c
    }

    async fn ping(proxy_addr: SocketAddr, host: &str, version: i32) -> String {
        let mut c = send_status_request(proxy_addr, host, version).await;
        let mut dec = Decoder::new(&mut c, Direction::Clientbound);
        dec.set_state(State::Status);
        let resp = dec.decode().await.expect("status");
        match resp.packet {
            Some(Packet::StatusResponse(StatusResponse { status })) => status,
            _ => panic!("expected status response, got {}", resp.describe()),
        }
    }

    #[tokio::test]
    async fn listener_caches_status_per_protocol_version() {
        let (backend, hits) = version_echo_backend(None).await;
        let proxy = Arc::new(Proxy::new(
            vec![Route::new(["*.example.com"], [backend.to_string()])],
            ProxySettings::default(),
        ));
        let (addr, server, tracker) = start_listener(proxy.clone()).await;

        let modern = ping(addr, "lobby.example.com", 765).await;
        let legacy = ping(addr, "lobby.example.com", 47).await;
        let cached = ping(addr, "lobby.example.com", 765).await;
        assert_eq!(modern, r#"{"version":{"protocol":765}}"#);
        assert_eq!(legacy, r#"{"version":{"protocol":47}}"#);
        assert_eq!(cached, modern);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        proxy.shutdown_token().cancel();
        server.await.expect("join").expect("serve");
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn client_hang_up_abandons_status_wait_but_cache_fills() {
        let gate = Arc::new(Notify::new());
        let (backend, hits) = version_echo_backend(Some(gate.clone())).await;
        let proxy = Arc::new(Proxy::new(
            vec![Route::new(["*.example.com"], [backend.to_string()])],
            ProxySettings::default(),
        ));
        let (addr, server, tracker) = start_listener(proxy.clone()).await;

        let c = send_status_request(addr, "lobby.example.com", 765).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend dialed");

        drop(c);
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("connection ends while the backend is still silent");
        assert!(proxy.ping_cache.is_empty());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while proxy.ping_cache.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loader still fills the cache");
        assert_eq!(proxy.ping_cache.loads(), 1);

        proxy.shutdown_token().cancel();
        server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn listener_forwards_login_with_read_ahead_bytes() {
        let backend_ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let backend_addr = backend_ln.local_addr().expect("addr");
        let proxy = Arc::new(Proxy::new(
            vec![Route::new(["play.example.com"], [backend_addr.to_string()])],
            ProxySettings::default(),
        ));

        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let proxy_addr = ln.local_addr().expect("addr");
        let tracker = TaskTracker::new();
        let server = tokio::spawn(serve_listener(ln, proxy.clone(), tracker.clone()));

        let hs = handshake_frame("play.example.com", 765, 2);
        let login_start = frame(&[0x00, 0x05, b'S', b't', b'e', b'v', b'e']);
        let mut c = TcpStream::connect(proxy_addr).await.expect("connect");
        c.write_all(&[hs.clone(), login_start.clone()].concat())
            .await
            .expect("write");

        let (mut b, _) = backend_ln.accept().await.expect("accept");
        let mut got = vec![0u8; hs.len() + login_start.len()];
        b.read_exact(&mut got).await.expect("read");
        assert_eq!(got, [hs, login_start].concat());


        b.write_all(b"from-backend").await.expect("write");
        let mut back = [0u8; 12];
        c.read_exact(&mut back).await.expect("read");
        assert_eq!(&back, b"from-backend");

        drop(c);
        drop(b);
        proxy.shutdown_token().cancel();
        server.await.expect("join").expect("serve");
        tracker.close();
        tracker.wait().await;
    }
}
