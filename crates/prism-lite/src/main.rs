use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "prism-lite",
    version,
    about = "Prism Lite - Minecraft Java Edition reverse proxy with virtual-host routing"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses LITE_CONFIG; then auto-detects lite.toml > lite.yaml > lite.yml from CWD; then falls back to the OS default path (Linux: /etc/prism-lite/lite.toml; others: user config dir).
    #[arg(long, env = "LITE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    prism_lite::lite::run(cli.config).await
}
