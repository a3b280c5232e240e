//! Adapter lifecycle supervision
//!
//! The adapter is a USB gadget that can disappear (unplug, firmware
//! wedge, serial error) at any moment. The supervisor loops forever:
//! find a matching serial port, open an adapter session, run the scan
//! loop until the session dies, then back off briefly and re-discover.

use std::future::Future;
use std::time::Duration;

use nametag_device::Badge;
use nametag_transport::{find_adapter_port, Adapter};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scanner::{scan_and_spawn, ScannerOptions};

/// Pause between discovery attempts and after a failed session.
pub const REDISCOVER_BACKOFF: Duration = Duration::from_millis(100);

/// Run adapter sessions until `shutdown` fires.
pub async fn supervise<F, Fut>(
    port_pattern: &Regex,
    runner: F,
    options: &ScannerOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    F: Fn(Badge) -> Fut + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    while !shutdown.is_cancelled() {
        let port = match find_adapter_port(port_pattern) {
            Ok(Some(port)) => port,
            Ok(None) => {
                backoff(&shutdown).await;
                continue;
            }
            Err(err) => {
                warn!("Port scan failed: {err}");
                backoff(&shutdown).await;
                continue;
            }
        };

        info!("Opening adapter on {port}");
        let adapter = match Adapter::open(&port) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!("Opening {port} failed: {err}");
                backoff(&shutdown).await;
                continue;
            }
        };

        match scan_and_spawn(
            adapter.clone(),
            runner.clone(),
            options,
            shutdown.child_token(),
        )
        .await
        {
            Ok(()) => {
                adapter.shutdown();
                break;
            }
            Err(err) => {
                warn!("Adapter session ended: {err}; re-discovering");
                adapter.shutdown();
                backoff(&shutdown).await;
            }
        }
    }
    Ok(())
}

async fn backoff(shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(REDISCOVER_BACKOFF) => {}
        _ = shutdown.cancelled() => {}
    }
}
