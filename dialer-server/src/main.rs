use clap::Parser;
use dialer_server::app;
use dialer_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::parse();
    app::run(config).await
}
