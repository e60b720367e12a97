//! Worker-side view of the master service.

use crate::error::Result;
use crate::ids::WorkerAttemptId;
use crate::master::Master;
use crate::types::{
    HeartbeatRequest, HeartbeatResponse, Location, RegisterWorkerRequest, RegisterWorkerResponse,
};
use async_trait::async_trait;
use psgrid_common::CommonError;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Calls a worker makes against the master.
///
/// Transport failures surface as retryable [`CommonError::NetworkError`]s
/// wrapped in [`crate::CoordinationError::Common`].
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Announce a worker attempt.
    async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse>;

    /// Renew the lease of a worker attempt.
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Report that every task of the attempt finished.
    async fn report_worker_done(&self, attempt: WorkerAttemptId) -> Result<()>;

    /// Report that the attempt cannot continue.
    async fn report_worker_failed(&self, attempt: WorkerAttemptId, reason: &str) -> Result<()>;

    /// Resolve the current master address.
    async fn get_master_location(&self) -> Result<Location>;

    /// Global minimum progress clock.
    async fn get_min_clock(&self) -> Result<u64>;
}

/// Client bound directly to a [`Master`] in the same process.
///
/// The binding can be swapped or dropped to model a failover or an
/// unreachable master.
#[derive(Default)]
pub struct InProcessMasterClient {
    master: RwLock<Option<Arc<Master>>>,
}

impl InProcessMasterClient {
    pub fn new(master: Arc<Master>) -> Self {
        Self {
            master: RwLock::new(Some(master)),
        }
    }

    /// Bind to another master instance.
    pub fn repoint(&self, master: Arc<Master>) {
        info!("Master client repointed to {}", master.location());
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master);
    }

    /// Drop the binding; every call fails until [`Self::repoint`].
    pub fn disconnect(&self) {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn master(&self) -> Result<Arc<Master>> {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CommonError::network_error("master is unreachable").into())
    }
}

#[async_trait]
impl MasterClient for InProcessMasterClient {
    async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<RegisterWorkerResponse> {
        Ok(self.master()?.register_worker(req).await)
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        Ok(self.master()?.heartbeat(req).await)
    }

    async fn report_worker_done(&self, attempt: WorkerAttemptId) -> Result<()> {
        self.master()?.worker_done(attempt).await
    }

    async fn report_worker_failed(&self, attempt: WorkerAttemptId, reason: &str) -> Result<()> {
        self.master()?
            .worker_failed(attempt, reason)
            .await
            .map(|_| ())
    }

    async fn get_master_location(&self) -> Result<Location> {
        Ok(self.master()?.location())
    }

    async fn get_min_clock(&self) -> Result<u64> {
        Ok(self.master()?.min_clock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::error::CoordinationError;
    use psgrid_common::Diagnose;

    #[tokio::test]
    async fn test_disconnected_client_fails_retryably() {
        let master = Arc::new(Master::new(
            MasterConfig::default(),
            Location::localhost(7000),
            Vec::new(),
        ));
        let client = InProcessMasterClient::new(Arc::clone(&master));
        assert_eq!(
            client.get_master_location().await.unwrap(),
            Location::localhost(7000)
        );

        client.disconnect();
        match client.get_master_location().await {
            Err(CoordinationError::Common(e)) => assert!(e.is_retryable()),
            other => panic!("unexpected {other:?}"),
        }

        client.repoint(master);
        assert_eq!(client.get_min_clock().await.unwrap(), 0);
    }
}
