//! CLI entry point (C10): argument parsing, config load, logger init, signal
//! handling, and exit codes. Everything interesting lives in `wg_relay`;
//! this binary is just process wiring around [`wg_relay::relay::Server`].

use std::process::ExitCode;

use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};

use wg_relay::config::Config;
use wg_relay::relay::Server;

#[derive(Debug, StructOpt)]
#[structopt(name = "wg-relay", about = "Obfuscating UDP relay for WireGuard traffic")]
struct Opt {
    /// Path to the JSON config file describing one or more `[[servers]]` entries.
    #[structopt(long = "config", parse(from_os_str))]
    config: std::path::PathBuf,

    /// Overrides the default `info` tracing filter (e.g. `debug`, `wg_relay=trace`).
    #[structopt(long = "log-level")]
    log_level: Option<String>,

    /// Load and validate configuration, print derived MTUs, then exit without
    /// binding any sockets. Useful for CI/config linting.
    #[structopt(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Opt::from_args();

    let filter = match &opt.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::load(&opt.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %opt.config.display(), "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if config.servers.is_empty() {
        tracing::error!("config contains no servers");
        return ExitCode::FAILURE;
    }

    if opt.dry_run {
        for entry in &config.servers {
            match entry.validate() {
                Ok((mode, _key)) => {
                    let overhead = wg_relay::codec::overhead_for(mode);
                    let max_v4 = wg_relay::wg::max_proxy_packet_size(entry.mtu, false);
                    let max_v6 = wg_relay::wg::max_proxy_packet_size(entry.mtu, true);
                    tracing::info!(
                        server = %entry.name,
                        proxy_mode = ?mode,
                        tunnel_mtu_v4 = wg_relay::wg::tunnel_mtu(max_v4, overhead),
                        tunnel_mtu_v6 = wg_relay::wg::tunnel_mtu(max_v6, overhead),
                        "config valid (dry run)"
                    );
                }
                Err(e) => {
                    tracing::error!(server = %entry.name, error = %e, "config invalid (dry run)");
                    return ExitCode::FAILURE;
                }
            }
        }
        return ExitCode::SUCCESS;
    }

    let mut servers = Vec::with_capacity(config.servers.len());
    for entry in config.servers {
        let name = entry.name.clone();
        match Server::start(entry).await {
            Ok(server) => servers.push(server),
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to start relay");
                for started in &servers {
                    started.stop().await;
                }
                return ExitCode::FAILURE;
            }
        }
    }

    tracing::info!(count = servers.len(), "all relays started");

    wait_for_shutdown_signal().await;

    tracing::info!("shutdown signal received, stopping relays");
    for server in &servers {
        server.stop().await;
    }

    ExitCode::SUCCESS
}

/// Waits for either `SIGINT` (Ctrl-C) or `SIGTERM`, whichever arrives first.
async fn wait_for_shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, relying on SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
