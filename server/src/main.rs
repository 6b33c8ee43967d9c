//! Take Control Server – coordinates capture nodes and collects their takes.
//!
//! This binary:
//! 1. Reads configuration from `take.conf`
//! 2. Announces itself on the LAN via mDNS so capture nodes can find it
//! 3. Runs an axum server with the control channel, the upload endpoints
//!    and the operator REST API

mod coordinator;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use take_common::config::Config;
use take_common::discovery::{self, ServiceRole};

const DEFAULT_PORT: u16 = 5000;
const MDNS_NAME: &str = "server";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        take_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Take Control Server starting (listen={}, uploads={}, calibration={})",
        config.server_listen_addr,
        config.upload_dir.display(),
        config.calibration_dir.display()
    );

    std::fs::create_dir_all(&config.upload_dir).context("Cannot create upload directory")?;
    std::fs::create_dir_all(&config.calibration_dir)
        .context("Cannot create calibration directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        on_signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── mDNS registration ────────────────────────────────────────────
    // Setting TAKE_DISABLE_MDNS=1 skips mDNS; capture nodes then need
    // SERVER_URL in their config.
    let discovery = if std::env::var("TAKE_DISABLE_MDNS").is_ok() {
        info!("TAKE_DISABLE_MDNS set – mDNS skipped");
        None
    } else {
        let port = config
            .server_listen_addr
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .unwrap_or(DEFAULT_PORT);
        let announced = tokio::task::spawn_blocking(move || {
            discovery::announce(ServiceRole::Control, MDNS_NAME, port, None)
        })
        .await
        .context("mDNS task failed")?;
        match announced {
            Ok(a) => Some(a),
            Err(e) => {
                warn!("mDNS registration failed (non-fatal): {e:#}");
                None
            }
        }
    };

    // ── HTTP + WebSocket server ──────────────────────────────────────
    let result = server::run(&config, cancel).await;

    if let Some(announcement) = discovery {
        announcement.withdraw();
    }

    result?;
    info!("Take Control Server stopped");
    Ok(())
}
