use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::lite::{
    admin,
    blacklist::Blacklist,
    config::{self, Config},
    logging, net,
    proxy::{self, Proxy, ProxySettings},
    runtime::{self, Runtime},
    telemetry::{self, ReloadSignal},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }
    log_warnings(&cfg);

    let admin_enabled = !cfg.admin_addr.trim().is_empty();
    tracing::info!(
        config = %resolved.path.display(),
        bind = %cfg.bind,
        admin_addr = %cfg.admin_addr,
        routes = cfg.routes.len(),
        "lite: starting"
    );

    let rt = Arc::new(Runtime::new());
    let prometheus = if admin_enabled {
        let handle = telemetry::init_prometheus()?;
        rt.install(telemetry::metrics_plugin())?;
        Some(Arc::new(handle))
    } else {
        None
    };
    if cfg.log_forwards {
        rt.install(runtime::access_log_plugin())?;
    }

    let blacklist = Arc::new(Blacklist::new());
    if let Some(path) = &cfg.blacklist_file {
        let n = blacklist.load_file(path)?;
        tracing::info!(path = %path.display(), entries = n, "blacklist: loaded");
    }

    let shutdown = CancellationToken::new();
    let proxy = Arc::new(
        Proxy::new(cfg.routes.clone(), ProxySettings::from(&cfg))
            .with_runtime(rt)
            .with_blacklist(blacklist)
            .with_shutdown(shutdown.clone()),
    );

    let (reload_tx, reload_rx) = watch::channel(ReloadSignal::new());
    let tracker = TaskTracker::new();
    let mut tasks = JoinSet::new();

    // Config reload loop (polling + admin-triggered).
    {
        let reloader = Reloader::new(resolved.path.clone(), &cfg, proxy.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            reloader.run(reload_rx, shutdown).await;
            Ok(())
        });
    }

    if admin_enabled {
        let addr = net::normalize_bind_addr(&cfg.admin_addr).into_owned();
        let state = admin::AdminState {
            proxy: proxy.clone(),
            prometheus,
            config_path: resolved.path.clone(),
            reload_tx,
        };
        let shutdown = shutdown.clone();
        tasks.spawn(async move { admin::serve(&addr, state, shutdown).await });
    }

    {
        let bind = cfg.bind.clone();
        let proxy = proxy.clone();
        let tracker = tracker.clone();
        tasks.spawn(async move { proxy::serve_tcp_with_shutdown(&bind, proxy, tracker).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Err(err))) => failure = Some(err),
                Some(Err(join_err)) => failure = Some(join_err.into()),
                _ => {}
            }
        }
    }
    shutdown.cancel();
    tracker.close();

    let drain = async {
        while tasks.join_next().await.is_some() {}
        tracker.wait().await;
    };
    // Hard cap so `docker stop` doesn't stall indefinitely.
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(active = tracker.len(), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn log_warnings(cfg: &Config) {
    for w in cfg.validate().warnings {
        tracing::warn!(warning = %w, "config: warning");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

type FileSig = (u64, u64);

/// Watches the config and blacklist files and applies changes to a running proxy.
struct Reloader {
    config_path: PathBuf,
    proxy: Arc<Proxy>,
    bind: String,
    enabled: bool,
    poll_interval: Duration,
    blacklist_file: Option<PathBuf>,
    config_sig: Option<FileSig>,
    blacklist_sig: Option<FileSig>,
}

impl Reloader {
    fn new(config_path: PathBuf, cfg: &Config, proxy: Arc<Proxy>) -> Self {
        let config_sig = file_sig(&config_path).ok();
        let blacklist_sig = cfg.blacklist_file.as_deref().and_then(|p| file_sig(p).ok());
        Self {
            config_path,
            proxy,
            bind: cfg.bind.clone(),
            enabled: cfg.reload.enabled,
            poll_interval: cfg.reload.poll_interval,
            blacklist_file: cfg.blacklist_file.clone(),
            config_sig,
            blacklist_sig,
        }
    }

    async fn run(mut self, mut reload_rx: watch::Receiver<ReloadSignal>, shutdown: CancellationToken) {
        let mut admin_open = true;
        loop {
            let sleep_dur = if self.enabled {
                self.poll_interval.max(Duration::from_millis(200))
            } else {
                Duration::from_secs(3600)
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                res = reload_rx.changed(), if admin_open => {
                    if res.is_err() {
                        // Admin is gone; keep polling.
                        admin_open = false;
                        continue;
                    }
                    tracing::info!(seq = reload_rx.borrow().seq, "reload: requested");
                    self.apply();
                }
                _ = tokio::time::sleep(sleep_dur) => {
                    if self.enabled {
                        self.poll();
                    }
                }
            }
        }
    }

    fn poll(&mut self) {
        if let Ok(sig) = file_sig(&self.config_path) {
            if self.config_sig != Some(sig) {
                self.apply();
                return;
            }
        }

        let Some(path) = self.blacklist_file.clone() else {
            return;
        };
        let sig = file_sig(&path).ok();
        if sig != self.blacklist_sig {
            self.blacklist_sig = sig;
            self.reload_blacklist(&path);
        }
    }

    fn apply(&mut self) {
        self.config_sig = file_sig(&self.config_path).ok();
        let cfg = match config::load_config(&self.config_path) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(path = %self.config_path.display(), error = %format!("{err:#}"), "reload: config load failed");
                return;
            }
        };
        log_warnings(&cfg);

        if cfg.bind != self.bind {
            tracing::warn!(old = %self.bind, new = %cfg.bind, "reload: bind address change requires a restart");
        }

        self.proxy.update_routes(cfg.routes.clone());
        self.proxy.update_settings(ProxySettings::from(&cfg));
        self.enabled = cfg.reload.enabled;
        self.poll_interval = cfg.reload.poll_interval;

        self.blacklist_file = cfg.blacklist_file.clone();
        match self.blacklist_file.clone() {
            Some(path) => {
                self.blacklist_sig = file_sig(&path).ok();
                self.reload_blacklist(&path);
            }
            None => {
                self.blacklist_sig = None;
                self.proxy.blacklist().replace(Default::default());
            }
        }

        tracing::info!(routes = cfg.routes.len(), "reload: applied");
    }

    fn reload_blacklist(&self, path: &Path) {
        match self.proxy.blacklist().load_file(path) {
            Ok(n) => tracing::info!(path = %path.display(), entries = n, "blacklist: reloaded"),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "blacklist: reload failed")
            }
        }
    }
}

fn file_sig(path: &Path) -> anyhow::Result<FileSig> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}
