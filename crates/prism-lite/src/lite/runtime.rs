use std::{
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;

use crate::lite::{
    events::{EventManager, ForwardEndedEvent, ForwardStartedEvent},
    registry::ActiveForwardTracker,
};

type PluginInit = Box<dyn FnOnce(&Runtime) -> anyhow::Result<()> + Send>;

/// An extension installed into the runtime, typically by subscribing to forward events.
pub struct Plugin {
    name: String,
    init: PluginInit,
}

impl Plugin {
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: FnOnce(&Runtime) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            init: Box::new(init),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name).finish()
    }
}

/// Observability substrate shared by every forward: the event bus, the active-forward
/// registry and the installed plugins.
#[derive(Debug, Default)]
pub struct Runtime {
    events: Arc<EventManager>,
    forwards: Arc<ActiveForwardTracker>,
    observability: AtomicBool,
    plugins: RwLock<Vec<String>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn forwards(&self) -> &Arc<ActiveForwardTracker> {
        &self.forwards
    }

    pub fn install(&self, plugin: Plugin) -> anyhow::Result<()> {
        let Plugin { name, init } = plugin;
        init(self).with_context(|| format!("plugin {name}: init"))?;
        tracing::info!(plugin = %name, "runtime: plugin installed");
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);
        self.observability.store(true, Ordering::Release);
        Ok(())
    }

    pub fn plugins(&self) -> Vec<String> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether forwards should do registry bookkeeping and emit events. Latches on the
    /// first time a plugin or a forward-event subscriber is seen.
    pub fn observability_enabled(&self) -> bool {
        if self.observability.load(Ordering::Acquire) {
            return true;
        }
        let on = !self
            .plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
            || self.events.has_subscriber::<ForwardStartedEvent>()
            || self.events.has_subscriber::<ForwardEndedEvent>();
        if on {
            self.observability.store(true, Ordering::Release);
        }
        on
    }
}

/// Logs every forward's start and end at info level.
pub fn access_log_plugin() -> Plugin {
    Plugin::new("access-log", |rt| {
        rt.events().subscribe(100, |e: &mut ForwardStartedEvent| {
            tracing::info!(
                connection_id = %e.connection_id,
                client = %e.client_addr,
                backend = %e.backend_addr,
                host = %e.host,
                route = %e.route_id,
                "forward started"
            );
        });
        rt.events().subscribe(100, |e: &mut ForwardEndedEvent| {
            let duration_ms = e
                .ended_at
                .duration_since(e.started_at)
                .unwrap_or_default()
                .as_millis() as u64;
            tracing::info!(
                connection_id = %e.connection_id,
                client = %e.client_addr,
                backend = ?e.backend_addr,
                host = %e.host,
                route = %e.route_id,
                reason = %e.reason,
                duration_ms,
                "forward ended"
            );
        });
        Ok(())
    })
}
