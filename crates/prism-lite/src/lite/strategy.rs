use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use rand::{RngExt, rng};
use serde::Serialize;
use thiserror::Error;

/// How long a recorded dial latency stays valid.
pub const LATENCY_TTL: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Sequential,
    Random,
    RoundRobin,
    LeastConnections,
    LowestLatency,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Sequential,
        Strategy::Random,
        Strategy::RoundRobin,
        Strategy::LeastConnections,
        Strategy::LowestLatency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::LeastConnections => "least-connections",
            Strategy::LowestLatency => "lowest-latency",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid strategy {0:?}, allowed: sequential, random, round-robin, least-connections, lowest-latency")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// Accepts `_` or spaces in place of `-`; the empty string is sequential.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut norm = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        while norm.contains("--") {
            norm = norm.replace("--", "-");
        }
        match norm.as_str() {
            "" | "sequential" => Ok(Strategy::Sequential),
            "random" => Ok(Strategy::Random),
            "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least-connections" | "leastconnections" => Ok(Strategy::LeastConnections),
            "lowest-latency" | "lowestlatency" => Ok(Strategy::LowestLatency),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    latency: Duration,
    recorded_at: Instant,
}

/// Per-proxy selection state shared by every route.
#[derive(Debug)]
pub struct StrategyManager {
    round_robin: DashMap<String, u64>,
    connections: DashMap<String, Arc<AtomicU64>>,
    // Live forwards per route key, for `max_connections`.
    route_connections: DashMap<String, Arc<AtomicU64>>,
    latencies: DashMap<String, LatencySample>,
    latency_ttl: Duration,
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyManager {
    pub fn new() -> Self {
        Self::with_latency_ttl(LATENCY_TTL)
    }

    pub fn with_latency_ttl(latency_ttl: Duration) -> Self {
        Self {
            round_robin: DashMap::new(),
            connections: DashMap::new(),
            route_connections: DashMap::new(),
            latencies: DashMap::new(),
            latency_ttl,
        }
    }

    /// Picks one of `backends`. Returns `None` only when `backends` is empty.
    pub fn get_next_backend(
        &self,
        strategy: Strategy,
        route_host: &str,
        backends: &[String],
    ) -> Option<String> {
        if backends.is_empty() {
            return None;
        }
        let idx = match strategy {
            Strategy::Sequential => 0,
            Strategy::Random => rng().random_range(0..backends.len()),
            Strategy::RoundRobin => self.next_round_robin(route_host, backends.len()),
            Strategy::LeastConnections => self.least_connections(backends),
            Strategy::LowestLatency => self.lowest_latency(backends),
        };
        backends.get(idx).cloned()
    }

    fn next_round_robin(&self, route_host: &str, len: usize) -> usize {
        let mut index = self.round_robin.entry(route_host.to_string()).or_insert(0);
        let pick = (*index % len as u64) as usize;
        *index += 1;
        pick
    }

    fn least_connections(&self, backends: &[String]) -> usize {
        let mut best = 0;
        let mut best_count = u64::MAX;
        for (i, b) in backends.iter().enumerate() {
            let count = self.connection_count(b);
            if count < best_count {
                best = i;
                best_count = count;
            }
        }
        best
    }

    fn lowest_latency(&self, backends: &[String]) -> usize {
        let mut best = 0;
        let mut best_latency = Duration::MAX;
        for (i, b) in backends.iter().enumerate() {
            match self.latency(b) {
                // Unmeasured backends go first so they get a sample.
                None => return i,
                Some(l) if l < best_latency => {
                    best = i;
                    best_latency = l;
                }
                Some(_) => {}
            }
        }
        best
    }

    pub fn round_robin_index(&self, route_host: &str) -> u64 {
        self.round_robin.get(route_host).map(|v| *v).unwrap_or(0)
    }

    /// Counts a connection to `backend` until the returned guard is dropped.
    pub fn increment_connection(&self, backend: &str) -> ConnectionGuard {
        ConnectionGuard::acquire(&self.connections, backend)
    }

    pub fn connection_count(&self, backend: &str) -> u64 {
        count(&self.connections, backend)
    }

    /// Counts a forward on the route keyed by `route_key` until the guard is dropped.
    pub fn increment_route_connection(&self, route_key: &str) -> ConnectionGuard {
        ConnectionGuard::acquire(&self.route_connections, route_key)
    }

    pub fn route_connection_count(&self, route_key: &str) -> u64 {
        count(&self.route_connections, route_key)
    }

    pub fn record_latency(&self, backend: &str, latency: Duration) {
        self.latencies.insert(
            backend.to_string(),
            LatencySample {
                latency,
                recorded_at: Instant::now(),
            },
        );
    }

    /// The latest sample for `backend`, if it has not expired.
    pub fn latency(&self, backend: &str) -> Option<Duration> {
        let sample = *self.latencies.get(backend)?;
        if sample.recorded_at.elapsed() > self.latency_ttl {
            self.latencies
                .remove_if(backend, |_, s| s.recorded_at == sample.recorded_at);
            return None;
        }
        Some(sample.latency)
    }
}

/// Decrements its connection counter exactly once, on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicU64>,
}

impl ConnectionGuard {
    fn acquire(counters: &DashMap<String, Arc<AtomicU64>>, key: &str) -> Self {
        let counter = counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

fn count(counters: &DashMap<String, Arc<AtomicU64>>, key: &str) -> u64 {
    counters
        .get(key)
        .map(|c| c.load(Ordering::Acquire))
        .unwrap_or(0)
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }
}
