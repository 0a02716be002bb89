//! Server binary: `ostore [host] [port]`.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use ostore::server::{Server, ServerConfig, DEFAULT_PORT};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let host = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.get(2) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid port: {raw}"))?,
        None => DEFAULT_PORT,
    };

    let config = ServerConfig {
        host,
        port,
        ..ServerConfig::default()
    };
    Server::new(config).run()
}
