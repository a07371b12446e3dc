// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Service discovery broker daemon.
//!
//! Listens on a local IPC endpoint, relays service offers to matching
//! subscribers, and retracts a client's offers when it goes away.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: socket under /tmp, endpoint (0, 7400)
//! ipcsd-broker
//!
//! # Explicit endpoint
//! ipcsd-broker --address-root /run/ipcsd --domain 1 --port 9000
//!
//! # From a configuration file
//! ipcsd-broker --config broker.json
//! ```

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::BrokerConfig;
use ipcsd::SdServer;

/// Centralized service discovery broker for local IPC.
#[derive(Parser, Debug)]
#[command(name = "ipcsd-broker")]
#[command(about = "Centralized service discovery broker for local IPC")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to create the broker socket in
    #[arg(long, conflicts_with = "config")]
    address_root: Option<PathBuf>,

    /// Domain part of the broker endpoint
    #[arg(long, conflicts_with = "config")]
    domain: Option<u32>,

    /// Port part of the broker endpoint
    #[arg(long, conflicts_with = "config")]
    port: Option<u32>,

    /// Log filter, e.g. "info" or "ipcsd=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    // SAFETY: on_signal only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn load_config(args: &Args) -> Result<BrokerConfig, config::ConfigError> {
    if let Some(path) = &args.config {
        return BrokerConfig::from_file(path);
    }
    let mut config = BrokerConfig::default();
    if let Some(root) = &args.address_root {
        config.address_root = root.clone();
    }
    if let Some(domain) = args.domain {
        config.domain = domain;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    };

    let server = match SdServer::new(config.socket_path()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("cannot create broker: {e}");
            std::process::exit(1);
        }
    };

    install_signal_handlers();
    server.start();
    tracing::info!(
        "broker listening on {} ({:?})",
        config.broker_address(),
        config.socket_path()
    );

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutdown signal received");
    server.stop();
}
