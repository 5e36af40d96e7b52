//! `csi-lvm`: serves LVM logical volumes to a container orchestrator through
//! the CSI Identity, Controller and Node services on a local Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use libcsi_lvm::config::parse_endpoint;
use libcsi_lvm::transport::server::CsiServer;
use libcsi_lvm::{CommandAdapter, DriverConfig, LvmDriver};

/// CSI driver for LVM logical volumes.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI endpoint, `unix://<path>`
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix://tmp/csi.sock")]
    endpoint: String,

    /// Driver name reported by GetPluginInfo
    #[arg(long = "drivername", env = "CSI_DRIVER_NAME", default_value = "csi-lvm")]
    driver_name: String,

    /// Identifier of this node
    #[arg(long = "nodeid", env = "CSI_NODE_ID", default_value = "")]
    node_id: String,

    /// Volume group used when a request names none
    #[arg(long, env = "CSI_VOLUME_GROUP", default_value = "default")]
    volume_group: String,

    /// Directory for the persisted registry; in-memory only when unset
    #[arg(long, env = "CSI_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Upper bound for a single LVM or mount call
    #[arg(long, env = "CSI_BACKEND_TIMEOUT_SECS", default_value = "60")]
    backend_timeout_secs: u64,

    /// Upper bound for waiting on a volume-group or path lock
    #[arg(long, env = "CSI_LOCK_TIMEOUT_SECS", default_value = "30")]
    lock_timeout_secs: u64,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            driver_name: self.driver_name.clone(),
            node_id: self.node_id.clone(),
            volume_group: self.volume_group.clone(),
            state_dir: self.state_dir.clone(),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            ..DriverConfig::default()
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let socket = parse_endpoint(&args.endpoint)
        .with_context(|| format!("invalid endpoint {}", args.endpoint))?;
    let config = args.driver_config();
    info!(
        driver = %config.driver_name,
        version = %config.vendor_version,
        node_id = %config.node_id,
        volume_group = %config.volume_group,
        "starting CSI driver"
    );

    let driver = Arc::new(LvmDriver::new(config, CommandAdapter::new()));
    let report = driver
        .recover()
        .await
        .context("registry recovery failed")?;
    info!(?report, "registry ready");

    let server = CsiServer::bind(&socket, Arc::clone(&driver))
        .with_context(|| format!("cannot listen on {}", socket.display()))?;

    tokio::select! {
        () = server.serve() => {
            error!("server stopped");
        }
        res = tokio::signal::ctrl_c() => {
            res.context("wait for shutdown signal")?;
            info!("shutting down");
        }
    }
    Ok(())
}
