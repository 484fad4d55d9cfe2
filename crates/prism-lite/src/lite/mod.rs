pub mod admin;
pub mod app;
pub mod backend;
pub mod blacklist;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod forward;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod proxy;
pub mod proxy_protocol;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod status;
pub mod strategy;
pub mod telemetry;
pub mod vhost;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
