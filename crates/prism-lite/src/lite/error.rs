use std::{error::Error as StdError, io, net::IpAddr, sync::Arc};

use thiserror::Error;

use crate::lite::{codec::CodecError, logging};

/// Errors raised on the forward and status paths.
///
/// Each error carries a verbosity: 0 is logged normally, 1 and above only at debug level.
#[derive(Debug, Error)]
pub enum LiteError {
    #[error("no route configured for host {host}")]
    RouteNotFound { host: String },

    #[error("no backend configured for route {route}")]
    NoBackendConfigured { route: String },

    #[error("client ip {ip} is blacklisted for route {route}")]
    Blacklisted { ip: IpAddr, route: String },

    #[error("route {route} reached its connection limit ({current}/{max})")]
    RouteFull { route: String, max: u32, current: u64 },

    #[error("failed to connect to backend {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("all backends failed{}", last_error_suffix(.last))]
    AllBackendsFailed {
        #[source]
        last: Option<Box<LiteError>>,
    },

    #[error("backend {backend}: failed to {stage}: {source}")]
    BackendIo {
        backend: String,
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("received unexpected {got}, expected {expected}")]
    UnexpectedPacket { got: String, expected: &'static str },

    #[error("client connection cancelled while {during}")]
    ClientCancelled { during: &'static str },

    #[error("status loader ended without a result")]
    LoaderAborted,

    #[error("failed to encode fallback status: {0}")]
    Fallback(#[from] serde_json::Error),

    /// An error shared between several waiters, e.g. a cached ping failure.
    #[error(transparent)]
    Shared(Arc<LiteError>),
}

fn last_error_suffix(last: &Option<Box<LiteError>>) -> String {
    match last {
        Some(err) => format!(", last error: {err}"),
        None => String::new(),
    }
}

impl LiteError {
    pub fn verbosity(&self) -> u8 {
        match self {
            LiteError::RouteNotFound { .. } | LiteError::ClientCancelled { .. } => 1,
            LiteError::AllBackendsFailed { .. } => 0,
            LiteError::Shared(inner) => inner.verbosity(),
            LiteError::Codec(c) if c.is_soft() => 1,
            other => {
                if is_connection_refused(other) || is_timeout(other) {
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Logs `message` at the level matching this error's verbosity.
    pub fn log(&self, message: &str) {
        logging::log_verbose(self.verbosity(), self, message);
    }
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e| (*e).source())
}

/// Walks the source chain looking for an OS "connection refused" or its textual form.
pub fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        e.to_string()
            .to_ascii_lowercase()
            .contains("connection refused")
    })
}

pub fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        e.downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::TimedOut)
            || e.downcast_ref::<tokio::time::error::Elapsed>().is_some()
    })
}
