//! Typed configuration snapshots for workers and the master.

use psgrid_common::{Configuration, DeployMode, Result, keys};
use std::time::Duration;

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deployment mode of the job
    pub deploy_mode: DeployMode,
    /// Tasks run by every worker
    pub task_num: usize,
    /// Period of worker heartbeats
    pub heartbeat_interval: Duration,
    /// Bound on the registration RPC
    pub register_timeout: Duration,
    /// Maximum age of the cached master location
    pub master_location_refresh: Duration,
    /// Retries when resolving the master location
    pub discovery_retries: u32,
    /// First backoff between discovery retries, doubled each time
    pub discovery_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            deploy_mode: DeployMode::Local,
            task_num: 1,
            heartbeat_interval: Duration::from_millis(1000),
            register_timeout: Duration::from_millis(5000),
            master_location_refresh: Duration::from_millis(5000),
            discovery_retries: 5,
            discovery_backoff: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn from_configuration(conf: &Configuration) -> Result<Self> {
        let d = Self::default();
        let config = Self {
            deploy_mode: conf.deploy_mode()?,
            task_num: conf.get_usize(keys::WORKER_TASK_NUMBER, d.task_num)?,
            heartbeat_interval: conf.get_duration_ms(
                keys::WORKER_HEARTBEAT_INTERVAL_MS,
                d.heartbeat_interval.as_millis() as u64,
            )?,
            register_timeout: conf.get_duration_ms(
                keys::WORKER_REGISTER_TIMEOUT_MS,
                d.register_timeout.as_millis() as u64,
            )?,
            master_location_refresh: conf.get_duration_ms(
                keys::MASTER_LOCATION_REFRESH_MS,
                d.master_location_refresh.as_millis() as u64,
            )?,
            discovery_retries: conf.get_u32(keys::MASTER_DISCOVERY_RETRIES, d.discovery_retries)?,
            discovery_backoff: conf.get_duration_ms(
                keys::MASTER_DISCOVERY_BACKOFF_MS,
                d.discovery_backoff.as_millis() as u64,
            )?,
        };
        if config.heartbeat_interval.is_zero() {
            return Err(psgrid_common::CommonError::configuration_error(
                "heartbeat interval must be positive",
            ));
        }
        Ok(config)
    }
}

/// Master-side settings.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Number of worker groups in the job
    pub worker_groups: u32,
    /// Workers in every group
    pub workers_per_group: u32,
    /// Number of parameter servers
    pub ps_number: u32,
    /// Attempt budget per worker slot
    pub worker_max_attempts: u32,
    /// Attempt budget per parameter server
    pub ps_max_attempts: u32,
    /// Silence after which an attempt's lease expires
    pub lease_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            worker_groups: 1,
            workers_per_group: 1,
            ps_number: 1,
            worker_max_attempts: 4,
            ps_max_attempts: 4,
            lease_timeout: Duration::from_millis(10_000),
        }
    }
}

impl MasterConfig {
    pub fn from_configuration(conf: &Configuration) -> Result<Self> {
        let d = Self::default();
        let config = Self {
            worker_groups: conf.get_u32(keys::WORKER_GROUP_NUMBER, d.worker_groups)?,
            workers_per_group: conf.get_u32(keys::WORKER_GROUP_SIZE, d.workers_per_group)?,
            ps_number: conf.get_u32(keys::PS_NUMBER, d.ps_number)?,
            worker_max_attempts: conf.get_u32(keys::WORKER_MAX_ATTEMPTS, d.worker_max_attempts)?,
            ps_max_attempts: conf.get_u32(keys::PS_MAX_ATTEMPTS, d.ps_max_attempts)?,
            lease_timeout: conf.get_duration_ms(
                keys::WORKER_LEASE_TIMEOUT_MS,
                d.lease_timeout.as_millis() as u64,
            )?,
        };
        if config.worker_max_attempts == 0 || config.ps_max_attempts == 0 {
            return Err(psgrid_common::CommonError::configuration_error(
                "attempt budgets must be at least 1",
            ));
        }
        Ok(config)
    }

    /// Heartbeat-driven lease monitor period.
    pub fn monitor_interval(&self) -> Duration {
        (self.lease_timeout / 4).max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let worker = WorkerConfig::from_configuration(&Configuration::new()).unwrap();
        assert_eq!(worker.task_num, 1);
        assert_eq!(worker.register_timeout, Duration::from_secs(5));

        let master = MasterConfig::from_configuration(&Configuration::new()).unwrap();
        assert_eq!(master.worker_max_attempts, 4);
        assert_eq!(master.monitor_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn test_overrides() {
        let conf = Configuration::new()
            .with(keys::WORKER_TASK_NUMBER, 2)
            .with(keys::WORKER_GROUP_NUMBER, 3)
            .with(keys::WORKER_GROUP_SIZE, 2)
            .with(keys::WORKER_LEASE_TIMEOUT_MS, 400);

        let worker = WorkerConfig::from_configuration(&conf).unwrap();
        assert_eq!(worker.task_num, 2);

        let master = MasterConfig::from_configuration(&conf).unwrap();
        assert_eq!(master.worker_groups, 3);
        assert_eq!(master.workers_per_group, 2);
        assert_eq!(master.lease_timeout, Duration::from_millis(400));
    }

    #[test]
    fn test_zero_attempt_budget_rejected() {
        let conf = Configuration::new().with(keys::WORKER_MAX_ATTEMPTS, 0);
        assert!(MasterConfig::from_configuration(&conf).is_err());
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let conf = Configuration::new().with(keys::WORKER_HEARTBEAT_INTERVAL_MS, 0);
        let err = WorkerConfig::from_configuration(&conf).unwrap_err();
        assert!(err.to_string().contains("heartbeat interval must be positive"));
    }
}
