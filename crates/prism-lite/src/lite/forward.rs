use std::{
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::lite::{
    conn::ClientConn,
    error::{LiteError, is_timeout},
    events::{ForwardEndReason, ForwardEndedEvent, ForwardStartedEvent},
    protocol::PacketContext,
    proxy::{Dialed, Proxy},
    registry::ActiveForward,
};

const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ClientToBackend,
    BackendToClient,
}

/// How one direction of a pipe ended.
#[derive(Debug)]
pub struct CopyResult {
    pub direction: CopyDirection,
    pub bytes: u64,
    /// `None` on a clean EOF from the reading side.
    pub error: Option<io::Error>,
}

#[derive(Debug)]
struct PipeOutcome {
    first: Option<CopyResult>,
    client_to_backend: u64,
    backend_to_client: u64,
}

impl Proxy {
    /// Forwards a login/transfer connection to the first backend of the matched route that
    /// accepts it, then pipes bytes both ways until either side closes.
    ///
    /// `handshake` is the client's handshake as decoded; any bytes the caller read past it
    /// must be available through [`ClientConn::take_buffered`].
    pub async fn forward<C>(&self, mut client: C, handshake: PacketContext) -> Result<(), LiteError>
    where
        C: ClientConn + 'static,
    {
        let Some(hs) = handshake.handshake() else {
            return Err(LiteError::UnexpectedPacket {
                got: handshake.describe(),
                expected: "Handshake",
            });
        };
        let client_addr = client.remote_addr();
        let cancel = client.cancellation().clone();

        let target = self.resolve_target(hs, client_addr)?;
        let route = target.matched.route.clone();
        metrics::counter!("lite_route_hits_total", "route" => target.matched.pattern.clone())
            .increment(1);

        let route_key = route.connection_key().to_string();
        if route.max_connections > 0 {
            let current = self.strategies().route_connection_count(&route_key);
            if current >= u64::from(route.max_connections) {
                return Err(LiteError::RouteFull {
                    route: route_key,
                    max: route.max_connections,
                    current,
                });
            }
        }

        let observe = self.runtime().observability_enabled();
        let forwards = self.runtime().forwards();
        let connection_id = if observe {
            forwards.next_connection_id()
        } else {
            String::new()
        };
        let started_at = SystemTime::now();

        let dialer = self.dialer();
        let dialed = try_backends(self.backend_iter(&target), |backend| {
            let guard = self.strategies().increment_connection(&backend);
            let (dialer, cancel, route, handshake) = (&dialer, &cancel, &route, &handshake);
            async move {
                let dialed = dialer
                    .dial_route(cancel, client_addr, route, &backend, handshake)
                    .await?;
                Ok((dialed, guard))
            }
        })
        .await;

        let (dialed, _conn_guard) = match dialed {
            Ok(v) => v,
            Err(err) => {
                if observe {
                    let ended = ForwardEndedEvent {
                        connection_id,
                        client_ip: Some(target.client_ip),
                        client_addr,
                        backend_addr: None,
                        host: target.host.clone(),
                        route_id: target.matched.pattern.clone(),
                        started_at,
                        ended_at: SystemTime::now(),
                        reason: ForwardEndReason::BackendConnectFailed,
                    };
                    drop(self.runtime().events().fire_parallel(ended, Vec::new()));
                }
                return Err(err);
            }
        };
        let Dialed {
            mut stream,
            backend,
            backend_addr,
        } = dialed;
        // Only established forwards count toward the route limit.
        let _route_guard = self.strategies().increment_route_connection(&route_key);

        let buffered = client.take_buffered();
        if !buffered.is_empty() {
            stream
                .write_all(&buffered)
                .await
                .map_err(|source| LiteError::BackendIo {
                    backend: backend.clone(),
                    stage: "write buffered client bytes",
                    source,
                })?;
        }

        tracing::info!(
            backend = %backend,
            strategy = %route.strategy,
            connections = self.strategies().connection_count(&backend),
            "lite: forwarding connection"
        );

        let active = observe.then(|| {
            let fwd = ActiveForward {
                connection_id,
                client_ip: Some(target.client_ip),
                client_addr,
                backend_addr,
                host: target.host.clone(),
                route_id: target.matched.pattern.clone(),
                started_at,
            };
            forwards.add(fwd.clone());
            self.runtime()
                .events()
                .fire(&mut ForwardStartedEvent::from(&fwd));
            fwd
        });

        let outcome = pipe(client, stream, &cancel).await;
        metrics::counter!("lite_bytes_client_to_backend_total")
            .increment(outcome.client_to_backend);
        metrics::counter!("lite_bytes_backend_to_client_total")
            .increment(outcome.backend_to_client);

        let reason = classify_end_reason(cancel.is_cancelled(), outcome.first.as_ref());
        match &outcome.first {
            Some(CopyResult {
                error: Some(err), ..
            }) => tracing::debug!(reason = %reason, error = %err, "lite: forward ended"),
            _ => tracing::debug!(reason = %reason, "lite: forward ended"),
        }

        if let Some(fwd) = active {
            forwards.remove(&fwd.connection_id);
            let ended = ForwardEndedEvent::from_forward(&fwd, SystemTime::now(), reason);
            drop(self.runtime().events().fire_parallel(ended, Vec::new()));
        }
        Ok(())
    }
}

/// Runs `attempt` for each backend until one succeeds.
///
/// A client cancellation stops the loop right away; every other failure moves on to the
/// next backend. Exhaustion reports the last failure.
pub(crate) async fn try_backends<I, T, F, Fut>(backends: I, mut attempt: F) -> Result<T, LiteError>
where
    I: IntoIterator<Item = String>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, LiteError>>,
{
    let mut last = None;
    for backend in backends {
        match attempt(backend.clone()).await {
            Ok(v) => return Ok(v),
            Err(err @ LiteError::ClientCancelled { .. }) => return Err(err),
            Err(err) => {
                let _span = tracing::debug_span!("attempt", backend = %backend).entered();
                err.log("lite: backend connection attempt failed");
                last = Some(Box::new(err));
            }
        }
    }
    Err(LiteError::AllBackendsFailed { last })
}

/// Copies in both directions on two tasks. Returns when either direction finishes or
/// `cancel` fires; the other direction is torn down.
async fn pipe<C>(client: C, backend: TcpStream, cancel: &CancellationToken) -> PipeOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (backend_rd, backend_wr) = backend.into_split();
    let (tx, mut rx) = mpsc::channel(2);
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));

    let c2b = tokio::spawn(copy_half(
        client_rd,
        backend_wr,
        CopyDirection::ClientToBackend,
        up.clone(),
        tx.clone(),
    ));
    let b2c = tokio::spawn(copy_half(
        backend_rd,
        client_wr,
        CopyDirection::BackendToClient,
        down.clone(),
        tx,
    ));

    let first = tokio::select! {
        _ = cancel.cancelled() => None,
        res = rx.recv() => res,
    };
    c2b.abort();
    b2c.abort();

    PipeOutcome {
        first,
        client_to_backend: up.load(Ordering::Relaxed),
        backend_to_client: down.load(Ordering::Relaxed),
    }
}

async fn copy_half<R, W>(
    mut rd: R,
    mut wr: W,
    direction: CopyDirection,
    copied: Arc<AtomicU64>,
    done: mpsc::Sender<CopyResult>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let error = loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(err) => break Some(err),
        };
        if let Err(err) = wr.write_all(&buf[..n]).await {
            break Some(err);
        }
        copied.fetch_add(n as u64, Ordering::Relaxed);
    };
    let _ = wr.shutdown().await;
    let _ = done
        .send(CopyResult {
            direction,
            bytes: copied.load(Ordering::Relaxed),
            error,
        })
        .await;
}

pub fn classify_end_reason(cancelled: bool, first: Option<&CopyResult>) -> ForwardEndReason {
    if cancelled {
        return ForwardEndReason::Shutdown;
    }
    let Some(res) = first else {
        return ForwardEndReason::Error;
    };
    match (&res.error, res.direction) {
        (Some(err), _) if is_timeout(err) => ForwardEndReason::Timeout,
        (None, CopyDirection::BackendToClient) => ForwardEndReason::BackendClosed,
        (None, CopyDirection::ClientToBackend) => ForwardEndReason::ClientClosed,
        _ => ForwardEndReason::Error,
    }
}
