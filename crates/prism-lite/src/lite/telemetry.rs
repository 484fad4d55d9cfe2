use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::lite::{
    events::{ForwardEndedEvent, ForwardStartedEvent},
    runtime::Plugin,
};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// Counts forward lifecycle events into the installed recorder.
pub fn metrics_plugin() -> Plugin {
    Plugin::new("metrics", |rt| {
        rt.events().subscribe(0, |_: &mut ForwardStartedEvent| {
            metrics::counter!("lite_forwards_started_total").increment(1);
            metrics::gauge!("lite_active_forwards").increment(1.0);
        });
        rt.events().subscribe(0, |e: &mut ForwardEndedEvent| {
            metrics::counter!("lite_forwards_ended_total", "reason" => e.reason.as_str())
                .increment(1);
            // Failed dials never emitted a start.
            if e.backend_addr.is_some() {
                metrics::gauge!("lite_active_forwards").decrement(1.0);
            }
        });
        Ok(())
    })
}

pub fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    // Monotonic counter; increment indicates a reload request.
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lite::{events::ForwardEndReason, runtime::Runtime};

    #[test]
    fn metrics_plugin_counts_lifecycle() {
        let rt = Runtime::new();
        rt.install(metrics_plugin()).expect("install");

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let started_at = UNIX_EPOCH + Duration::from_secs(1);
        let mut started = ForwardStartedEvent {
            connection_id: "lfwd-1".into(),
            client_ip: Some("198.51.100.5".parse().expect("ip")),
            client_addr: "198.51.100.5:5000".parse().expect("addr"),
            backend_addr: "10.0.0.1:25565".parse().expect("addr"),
            host: "play.example.com".into(),
            route_id: "*.example.com".into(),
            started_at,
        };
        let mut ended = ForwardEndedEvent {
            connection_id: started.connection_id.clone(),
            client_ip: started.client_ip,
            client_addr: started.client_addr,
            backend_addr: Some(started.backend_addr),
            host: started.host.clone(),
            route_id: started.route_id.clone(),
            started_at,
            ended_at: started_at + Duration::from_secs(3),
            reason: ForwardEndReason::ClientClosed,
        };

        metrics::with_local_recorder(&recorder, || {
            rt.events().fire(&mut started);
            rt.events().fire(&mut ended);
        });

        let out = handle.render();
        assert!(out.contains("lite_forwards_started_total 1"), "{out}");
        assert!(
            out.contains("lite_forwards_ended_total{reason=\"client_closed\"} 1"),
            "{out}"
        );
        assert!(out.contains("lite_active_forwards 0"), "{out}");
    }

    #[test]
    fn reload_signal_increments() {
        let mut s = ReloadSignal::new();
        s.next();
        s.next();
        assert_eq!(s.seq, 2);
        assert_eq!(unix_ms(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
    }
}
