//! MCVirt node daemon (mcvirtd).
//!
//! One daemon runs on every node of a cluster. It owns the node's JSON
//! configuration, drives LVM, DRBD and libvirt through shell-outs, and
//! serves requests from the `mcvirt` CLI and from peer daemons.
//!
//! Usage:
//!   mcvirtd [OPTIONS]
//!
//! Startup:
//! 1. Open the config stores under the data directory
//! 2. Create the initial admin user and the node CA if missing
//! 3. Finish any pending config schema upgrade
//! 4. Run the accept loop until SIGINT or a shutdown request

mod auth;
mod certificate;
mod cluster;
mod config;
mod context;
mod daemon;
mod drbd;
mod hard_drive;
mod libvirt;
mod locks;
mod network;
mod ops;
mod remote;
mod request;
mod session;
mod storage;
mod transaction;
mod vm;
mod volume;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use mcvirt_core::command::{CommandRunner, SystemRunner};
use mcvirt_core::tcp_transport::TcpTransport;
use mcvirt_core::tls::{self, CaSource, TlsTransport};
use mcvirt_core::transport::Transport;
use mcvirt_proto::constants::MCVIRT_LISTEN_PORT;
use mcvirt_proto::defaults::{
    DEFAULT_BIND_ADDR, DEFAULT_DATA_DIR, DEFAULT_DRBD_CONFIG_DIR, DEFAULT_SHUTDOWN_WAIT_SECS,
};
use mcvirt_proto::McvResult;

use crate::daemon::{NodeState, Settings, Timings, VersionPolicy};
use crate::libvirt::VirshHypervisor;

/// Pooled connections kept per peer.
const MAX_CONNS_PER_PEER: usize = 4;

/// MCVirt node daemon
#[derive(Parser, Debug)]
#[command(name = "mcvirtd", version, about = "MCVirt node daemon")]
struct Args {
    /// Data directory holding the node configuration
    #[arg(short = 'd', long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = DEFAULT_BIND_ADDR)]
    bind: String,

    /// Listen port; every node of a cluster uses the same one
    #[arg(short = 'p', long, default_value_t = MCVIRT_LISTEN_PORT)]
    port: u16,

    /// Node name (defaults to the system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Serve and connect over TLS using the node's generated certificates
    #[arg(long)]
    tls: bool,

    /// Server certificate (PEM); implies --tls
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Server private key (PEM); implies --tls
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Password of the initial `admin` user, used only on first start
    #[arg(long, env = "MCVIRT_ADMIN_PASSWORD")]
    initial_admin_password: Option<String>,

    /// Directory DRBD resource files are written to
    #[arg(long, default_value = DEFAULT_DRBD_CONFIG_DIR)]
    drbd_config_dir: PathBuf,

    /// How strictly peer versions must match
    #[arg(long, value_enum, default_value_t = VersionPolicy::Exact)]
    version_policy: VersionPolicy,

    /// Seconds an offline migration waits for the guest to shut down
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_WAIT_SECS)]
    shutdown_wait: u64,
}

impl Args {
    fn use_tls(&self) -> bool {
        self.tls || self.tls_cert.is_some()
    }
}

async fn system_hostname(runner: &dyn CommandRunner) -> McvResult<String> {
    let name = runner.run_ok("hostname", &[]).await?;
    Ok(name.trim().to_string())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("mcvirtd v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = tokio::fs::create_dir_all(&args.data_dir).await {
        error!("failed to create data directory {}: {}", args.data_dir.display(), e);
        std::process::exit(1);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let hostname = match args.hostname.clone() {
        Some(name) => name,
        None => match system_hostname(runner.as_ref()).await {
            Ok(name) => name,
            Err(e) => {
                error!("cannot determine hostname: {}", e);
                std::process::exit(1);
            }
        },
    };

    let settings = Settings {
        data_dir: args.data_dir.clone(),
        drbd_config_dir: args.drbd_config_dir.clone(),
        port: args.port,
        version: env!("CARGO_PKG_VERSION").to_string(),
        version_policy: args.version_policy,
        timings: Timings {
            shutdown_wait: Duration::from_secs(args.shutdown_wait),
            ..Timings::default()
        },
    };
    let timeout = settings.timings.connect_timeout;

    let transport: Arc<dyn Transport> = if args.use_tls() {
        Arc::new(TlsTransport::new(
            CaSource::PerPeer(settings.ssl_dir()),
            MAX_CONNS_PER_PEER,
            timeout,
        ))
    } else {
        Arc::new(TcpTransport::new(MAX_CONNS_PER_PEER, timeout))
    };
    info!("peer transport: {}", transport.name());

    let hypervisor = Arc::new(VirshHypervisor::new(runner.clone(), args.data_dir.join("libvirt")));
    let node = match NodeState::new(hostname, settings, runner, hypervisor, transport).await {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    match auth::ensure_admin(&node, args.initial_admin_password.as_deref()).await {
        Ok(Some(password)) => warn!("initial password of user admin: {}", password),
        Ok(None) => {}
        Err(e) => {
            error!("failed to create initial user: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = certificate::ensure_ca(&node).await {
        error!("failed to create node CA: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = storage::migrate_legacy_config(&node).await {
        error!("configuration upgrade failed: {}", e);
        std::process::exit(1);
    }

    let acceptor = if args.use_tls() {
        let paths = match (args.tls_cert.clone(), args.tls_key.clone()) {
            (Some(cert), Some(key)) => Ok((cert, key)),
            _ => certificate::ensure_server_cert(&node).await,
        };
        match paths.and_then(|(cert, key)| tls::build_acceptor(&cert, &key)) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("failed to set up TLS: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let listener = match mcvirt_core::net::create_listen_socket(&args.bind, args.port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to listen on {}:{}: {}", args.bind, args.port, e);
            std::process::exit(1);
        }
    };

    info!("mcvirtd ready on {}:{} as {}", args.bind, args.port, node.hostname);

    let accept_node = node.clone();
    let accept = tokio::spawn(async move {
        if let Err(e) = request::accept_loop(accept_node, listener, acceptor).await {
            error!("accept loop failed: {}", e);
        }
    });

    let shutdown = node.shutdown_notify.clone();
    tokio::select! {
        _ = shutdown.notified() => {
            info!("shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
    }

    node.shutdown_notify.notify_waiters();
    if let Err(e) = accept.await {
        warn!("accept loop task: {}", e);
    }
    if let Err(e) = node.transport.shutdown().await {
        warn!("transport shutdown failed: {}", e);
    }

    info!("mcvirtd stopped");
}
