use std::sync::Arc;

use crate::lite::{
    net::{self, DEFAULT_MINECRAFT_PORT},
    strategy::{Strategy, StrategyManager},
};

/// Yields each distinct backend of a route at most once, in the order the strategy picks them.
///
/// Addresses are canonicalized up front (default port appended) so duplicates such as
/// `mc.local` and `mc.local:25565` collapse into one candidate.
#[derive(Debug)]
pub struct BackendIterator {
    manager: Arc<StrategyManager>,
    strategy: Strategy,
    route_host: String,
    remaining: Vec<String>,
}

impl BackendIterator {
    pub fn new(
        manager: Arc<StrategyManager>,
        strategy: Strategy,
        route_host: impl Into<String>,
        backends: &[String],
    ) -> Self {
        let mut remaining: Vec<String> = Vec::with_capacity(backends.len());
        for b in backends {
            if b.trim().is_empty() {
                continue;
            }
            let canonical = net::with_default_port(b, DEFAULT_MINECRAFT_PORT);
            if !remaining.contains(&canonical) {
                remaining.push(canonical);
            }
        }
        Self {
            manager,
            strategy,
            route_host: route_host.into(),
            remaining,
        }
    }

    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }
}

impl Iterator for BackendIterator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let pick = self
            .manager
            .get_next_backend(self.strategy, &self.route_host, &self.remaining)?;
        self.remaining.retain(|b| *b != pick);
        Some(pick)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining.len()))
    }
}
