// src/main.rs

//! The main entry point for the pmproxy daemon.

use anyhow::Result;
use pmproxy::config::Config;
use pmproxy::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

const VERSION: &str = env!("PMPROXY_BUILD_VERSION");

// All client I/O is driven from a single reactor thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--version") {
        println!("pmproxy version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("pmproxy.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        let Some(port_str) = args.get(port_index + 1) else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        };
        let port = match port_str.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("Invalid port number: {port_str}");
                std::process::exit(1);
            }
        };
        config = match config.with_port(port) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Invalid configuration: {e}");
                std::process::exit(1);
            }
        };
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config, Vec::new()).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
