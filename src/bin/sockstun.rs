//! sockstun binary
//!
//! Usage: sockstun [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to a TOML configuration file
//!   -h, --help           Print help information
//!
//! Without `--config`, configuration is read from `SOCKSTUN_*` variables.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sockstun::client::TunnelClient;
use sockstun::core::{Role, TunnelConfig};
use sockstun::server::TunnelServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let config = match args.get(1).map(String::as_str) {
        None => TunnelConfig::from_env().context("loading configuration from environment")?,
        Some("-h" | "--help") => {
            print_usage();
            return Ok(());
        }
        Some("-c" | "--config") => {
            let Some(path) = args.get(2) else {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            };
            TunnelConfig::from_file(path).with_context(|| format!("loading {path}"))?
        }
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            return Ok(());
        }
    };

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    let config = Arc::new(config);
    match config.role {
        Role::Client => {
            let client = TunnelClient::bind(Arc::clone(&config)).await?;
            tracing::info!(
                socks = %client.local_addr(),
                server = ?config.server_addr,
                "client ready"
            );
            tokio::signal::ctrl_c().await?;
            client.shutdown().await;
        }
        Role::Server => {
            let server = TunnelServer::bind(Arc::clone(&config)).await?;
            tracing::info!(addr = %server.local_addr(), "server ready");
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
    }

    tracing::info!("bye");
    Ok(())
}

fn print_usage() {
    println!(
        r#"sockstun - encrypted SOCKS5 tunnel

USAGE:
    sockstun [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to a TOML configuration file
    -h, --help              Print help information

ENVIRONMENT (used when --config is absent):
    SOCKSTUN_MODE           client | server
    SOCKSTUN_BIND           listen address
    SOCKSTUN_SERVER         tunnel server address (client)
    SOCKSTUN_SECRET         shared secret
    SOCKSTUN_USE_IV         true | false (default true)
    SOCKSTUN_HOPS           extra hops, comma separated
    SOCKSTUN_LOG            default log filter
    RUST_LOG                overrides the log filter"#
    );
}
