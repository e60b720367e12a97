//! PS-Agent: a worker attempt's handle on the master.
//!
//! The agent registers its worker attempt, keeps a cached copy of the master
//! location and relays heartbeats and completion reports.

mod client;

pub use client::*;

use crate::config::WorkerConfig;
use crate::error::{CoordinationError, Result};
use crate::ids::{PSAgentAttemptId, WorkerAttemptId};
use crate::types::{
    HeartbeatRequest, HeartbeatResponse, Location, RegisterWorkerRequest, RegisterWorkerResponse,
};
use psgrid_common::Diagnose;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CachedLocation {
    location: Location,
    fetched_at: Instant,
}

pub struct PSAgent {
    id: PSAgentAttemptId,
    attempt_id: WorkerAttemptId,
    client: Arc<dyn MasterClient>,
    config: WorkerConfig,
    master_location: RwLock<Option<CachedLocation>>,
}

impl PSAgent {
    pub fn new(
        attempt_id: WorkerAttemptId,
        client: Arc<dyn MasterClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: PSAgentAttemptId::for_worker_attempt(&attempt_id),
            attempt_id,
            client,
            config,
            master_location: RwLock::new(None),
        }
    }

    pub fn get_id(&self) -> PSAgentAttemptId {
        self.id
    }

    pub fn attempt_id(&self) -> WorkerAttemptId {
        self.attempt_id
    }

    /// Register the worker attempt with the master.
    ///
    /// The call is bounded by the configured registration timeout.
    pub async fn worker_register(&self, location: Location) -> Result<RegisterWorkerResponse> {
        let req = RegisterWorkerRequest {
            attempt_id: self.attempt_id,
            location,
        };
        let timeout = self.config.register_timeout;

        match tokio::time::timeout(timeout, self.client.register_worker(req)).await {
            Ok(resp) => {
                let resp = resp?;
                info!(
                    "{} registration answered {:?}, min clock {}",
                    self.attempt_id, resp.command, resp.min_clock
                );
                Ok(resp)
            }
            Err(_) => {
                warn!("{} registration timed out after {:?}", self.attempt_id, timeout);
                Err(CoordinationError::RegistrationTimeout {
                    attempt: self.attempt_id,
                    timeout,
                })
            }
        }
    }

    /// Where the master is, served from cache while the cache is fresh.
    pub async fn get_master_location(&self) -> Result<Location> {
        if let Some(cached) = self.cached_location() {
            if cached.fetched_at.elapsed() < self.config.master_location_refresh {
                return Ok(cached.location);
            }
        }

        let location = self.discover_master().await?;
        *self
            .master_location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(CachedLocation {
            location: location.clone(),
            fetched_at: Instant::now(),
        });
        Ok(location)
    }

    /// Forget the cached master location; the next lookup rediscovers it.
    pub fn on_master_failover(&self) {
        info!("{} dropping cached master location", self.id);
        *self
            .master_location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn cached_location(&self) -> Option<CachedLocation> {
        self.master_location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve the master location, retrying transient failures with
    /// exponential backoff.
    async fn discover_master(&self) -> Result<Location> {
        let mut delay = self.config.discovery_backoff;
        let mut retries = 0;

        loop {
            match self.client.get_master_location().await {
                Ok(location) => {
                    debug!("{} resolved master at {}", self.id, location);
                    return Ok(location);
                }
                Err(CoordinationError::Common(e))
                    if e.is_retryable() && retries < self.config.discovery_retries =>
                {
                    retries += 1;
                    let floor = Duration::from_millis(e.retry_delay_ms().unwrap_or_default());
                    let wait = delay.max(floor);
                    warn!(
                        "Master discovery failed ({}), retry {}/{} in {:?}",
                        e, retries, self.config.discovery_retries, wait
                    );
                    tokio::time::sleep(wait).await;
                    delay = wait * 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn heartbeat(&self, clock: u64, active_tasks: usize) -> Result<HeartbeatResponse> {
        self.client
            .heartbeat(HeartbeatRequest {
                attempt_id: self.attempt_id,
                clock,
                active_tasks,
            })
            .await
    }

    pub async fn report_done(&self) -> Result<()> {
        self.client.report_worker_done(self.attempt_id).await
    }

    pub async fn report_failed(&self, reason: &str) -> Result<()> {
        self.client
            .report_worker_failed(self.attempt_id, reason)
            .await
    }

    /// Global minimum clock as currently seen by the master.
    pub async fn min_clock(&self) -> Result<u64> {
        self.client.get_min_clock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::master::Master;
    use crate::types::RegisterCommand;
    use async_trait::async_trait;
    use psgrid_common::CommonError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails location lookups a fixed number of times, counting calls.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        location: Location,
    }

    #[async_trait]
    impl MasterClient for Flaky {
        async fn register_worker(
            &self,
            _req: RegisterWorkerRequest,
        ) -> Result<RegisterWorkerResponse> {
            std::future::pending().await
        }
        async fn heartbeat(&self, _req: HeartbeatRequest) -> Result<HeartbeatResponse> {
            unimplemented!()
        }
        async fn report_worker_done(&self, _attempt: WorkerAttemptId) -> Result<()> {
            Ok(())
        }
        async fn report_worker_failed(
            &self,
            _attempt: WorkerAttemptId,
            _reason: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn get_master_location(&self) -> Result<Location> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(CommonError::network_error("connection refused").into())
            } else {
                Ok(self.location.clone())
            }
        }
        async fn get_min_clock(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn attempt() -> WorkerAttemptId {
        "WorkerAttempt_0_0_0".parse().unwrap()
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            location: Location::localhost(7000),
        })
    }

    #[test]
    fn test_agent_id_derives_from_worker_attempt() {
        let agent = PSAgent::new(attempt(), flaky(0), WorkerConfig::default());
        assert_eq!(agent.get_id().to_string(), "PSAgentAttempt_0_0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_retries_with_backoff() {
        let client = flaky(3);
        let agent = PSAgent::new(attempt(), client.clone(), WorkerConfig::default());

        let start = Instant::now();
        let location = agent.get_master_location().await.unwrap();
        assert_eq!(location, Location::localhost(7000));
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_gives_up_after_retry_budget() {
        let client = flaky(u32::MAX);
        let config = WorkerConfig {
            discovery_retries: 2,
            ..WorkerConfig::default()
        };
        let agent = PSAgent::new(attempt(), client.clone(), config);

        let err = agent.get_master_location().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Common(CommonError::NetworkError { .. })));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_times_out() {
        let agent = PSAgent::new(attempt(), flaky(0), WorkerConfig::default());
        let err = agent
            .worker_register(Location::localhost(9000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::RegistrationTimeout { timeout, .. }
                if timeout == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_location_cache_and_failover() {
        let master = Arc::new(Master::new(
            MasterConfig::default(),
            Location::localhost(7000),
            Vec::new(),
        ));
        let client = Arc::new(InProcessMasterClient::new(Arc::clone(&master)));
        let agent = PSAgent::new(attempt(), client, WorkerConfig::default());

        let first = agent.get_master_location().await.unwrap();
        master.relocate(Location::localhost(7001));
        // Cache still fresh, no failover event yet
        assert_eq!(agent.get_master_location().await.unwrap(), first);

        agent.on_master_failover();
        assert_eq!(
            agent.get_master_location().await.unwrap(),
            Location::localhost(7001)
        );
    }

    #[tokio::test]
    async fn test_register_through_in_process_client() {
        let master = Arc::new(Master::new(
            MasterConfig::default(),
            Location::localhost(7000),
            Vec::new(),
        ));
        let worker_attempt = master
            .allocate_worker_attempt("Worker_0_0".parse().unwrap())
            .await
            .unwrap();
        let client = Arc::new(InProcessMasterClient::new(master));
        let agent = PSAgent::new(worker_attempt, client, WorkerConfig::default());

        let resp = agent.worker_register(Location::localhost(9000)).await.unwrap();
        assert_eq!(resp.command, RegisterCommand::Success);
    }
}
