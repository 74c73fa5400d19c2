use std::path::Path;

use clap::Parser;
use cluster_agent::app;
use cluster_agent::config::{Config, ConfigFile};

/// Default config file name.
const DEFAULT_CONFIG: &str = "cluster-agent.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls CryptoProvider"))?;

    // Load config file as env-var defaults (before clap parsing)
    let config_file_path =
        std::env::var("CLUSTER_AGENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = Path::new(&config_file_path);
    if config_path.exists() {
        match ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("WARNING: failed to load {}: {}", config_path.display(), e),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
