// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use anyhow::{Context, Result};
use cdpd::config::ProxyConfig;
use cdpd::server::ProxyServer;
use clap::Parser;

#[derive(Parser)]
#[command(name = "cdpd", about = "Persistent multiplexing proxy for the Chrome DevTools Protocol", version)]
struct Args {
    /// Address to bind the HTTP/WS server on.
    #[arg(long, env = "CDPD_BIND")]
    bind: Option<String>,

    /// Port to bind the HTTP/WS server on.
    #[arg(long, env = "CDPD_PORT")]
    port: Option<u16>,

    /// Optional TOML config file, layered under built-in defaults and above
    /// by the flags/env vars on this command line.
    #[arg(long, env = "CDPD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CDPD_LOG", default_value = "info")]
    log: String,

    /// Directory to write rotated log files under. Defaults to
    /// `~/.chrome-cdp-cli/logs/`; pass an empty flag to log to stdout only.
    #[arg(long, env = "CDPD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Disable file logging entirely, even if a log directory would
    /// otherwise be used.
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_dir = if args.no_log_file {
        None
    } else {
        Some(args.log_dir.clone().unwrap_or_else(ProxyConfig::default_log_dir))
    };
    let _log_guard = cdpd::logging::init(&args.log, log_dir.as_deref());

    let mut config = ProxyConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_host = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = &log_dir {
        config.log_dir = Some(dir.clone());
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(bind = %config.bind_host, port = config.port, "starting cdpd");
    ProxyServer::new(config).run().await
}
