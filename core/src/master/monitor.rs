//! Background lease monitor.

use super::Master;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Spawn the loop that fails attempts whose lease lapsed.
///
/// The loop ends when the master stops or the job is killed.
pub fn spawn_lease_monitor(master: Arc<Master>) -> JoinHandle<()> {
    tokio::spawn(run_lease_monitor(master))
}

pub async fn run_lease_monitor(master: Arc<Master>) {
    let shutdown = master.shutdown_token();
    let mut interval = tokio::time::interval(master.config().monitor_interval());
    info!(
        "Lease monitor started. Timeout: {:?}",
        master.config().lease_timeout
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let replacements = master.expire_leases().await;
        if !replacements.is_empty() {
            warn!("Replaced lapsed attempts: {:?}", replacements);
        }
    }

    info!("Lease monitor stopped");
}
