//! Typed access to the externally loaded job configuration.
//!
//! Loading and validating the raw settings is the host process's job. The
//! coordination core only reads them, through the accessors below, and turns
//! malformed values into [`CommonError::ConfigurationError`].

use crate::error::{CommonError, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Well-known configuration keys.
pub mod keys {
    pub const DEPLOY_MODE: &str = "psgrid.deploy.mode";
    pub const APP_ID: &str = "psgrid.app.id";
    pub const JOB_USER: &str = "psgrid.job.user";

    pub const WORKER_GROUP_NUMBER: &str = "psgrid.worker.group.number";
    pub const WORKER_GROUP_SIZE: &str = "psgrid.worker.group.size";
    pub const WORKER_TASK_NUMBER: &str = "psgrid.worker.task.number";
    pub const WORKER_MAX_ATTEMPTS: &str = "psgrid.worker.max.attempts";
    pub const WORKER_HEARTBEAT_INTERVAL_MS: &str = "psgrid.worker.heartbeat.interval.ms";
    pub const WORKER_LEASE_TIMEOUT_MS: &str = "psgrid.worker.lease.timeout.ms";
    pub const WORKER_REGISTER_TIMEOUT_MS: &str = "psgrid.worker.register.timeout.ms";

    pub const PS_NUMBER: &str = "psgrid.ps.number";
    pub const PS_MAX_ATTEMPTS: &str = "psgrid.ps.max.attempts";

    pub const MASTER_LOCATION_REFRESH_MS: &str = "psgrid.master.location.refresh.ms";
    pub const MASTER_DISCOVERY_RETRIES: &str = "psgrid.master.discovery.retries";
    pub const MASTER_DISCOVERY_BACKOFF_MS: &str = "psgrid.master.discovery.backoff.ms";
}

/// How the job processes are deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeployMode {
    /// All roles in one host process
    #[default]
    Local,
    /// Roles spread over a cluster manager
    Cluster,
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Local => f.write_str("LOCAL"),
            DeployMode::Cluster => f.write_str("CLUSTER"),
        }
    }
}

impl FromStr for DeployMode {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(DeployMode::Local),
            "CLUSTER" | "YARN" => Ok(DeployMode::Cluster),
            other => Err(CommonError::configuration_error(format!(
                "unknown deploy mode '{}'",
                other
            ))),
        }
    }
}

/// Key/value job configuration with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        self.parse_or(key, default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32> {
        self.parse_or(key, default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        self.parse_or(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        self.parse_or(key, default)
    }

    /// Read a millisecond count as a [`Duration`].
    pub fn get_duration_ms(&self, key: &str, default_ms: u64) -> Result<Duration> {
        self.get_u64(key, default_ms).map(Duration::from_millis)
    }

    pub fn deploy_mode(&self) -> Result<DeployMode> {
        match self.get_str(keys::DEPLOY_MODE) {
            Some(raw) => raw.parse(),
            None => Ok(DeployMode::default()),
        }
    }

    /// The configured application id, or a freshly generated one.
    ///
    /// Callers must resolve this once per process and keep the result.
    pub fn resolve_app_id(&self) -> String {
        self.get_str(keys::APP_ID)
            .map(str::to_string)
            .unwrap_or_else(generate_app_id)
    }

    /// The configured job user, falling back to `$USER`.
    pub fn resolve_user(&self) -> String {
        self.get_str(keys::JOB_USER)
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get_str(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .with_configuration_context(|| format!("invalid value '{}' for {}", raw, key)),
        }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut conf = Configuration::new();
        for (k, v) in iter {
            conf.set(k, v);
        }
        conf
    }
}

/// Generate an application id of the form `application_<uuid>`.
pub fn generate_app_id() -> String {
    let app_id = format!("application_{}", Uuid::new_v4().simple());
    debug!("Generated application id {}", app_id);
    app_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_typed_accessors_with_defaults() {
        let conf = Configuration::new()
            .with(keys::WORKER_TASK_NUMBER, 4)
            .with(keys::WORKER_HEARTBEAT_INTERVAL_MS, 250)
            .with("flag", "true");

        assert_eq!(conf.get_usize(keys::WORKER_TASK_NUMBER, 1).unwrap(), 4);
        assert_eq!(conf.get_usize(keys::WORKER_GROUP_SIZE, 3).unwrap(), 3);
        assert_eq!(
            conf.get_duration_ms(keys::WORKER_HEARTBEAT_INTERVAL_MS, 1000)
                .unwrap(),
            Duration::from_millis(250)
        );
        assert!(conf.get_bool("flag", false).unwrap());
    }

    #[test]
    fn test_malformed_value_is_configuration_error() {
        let conf = Configuration::new().with(keys::WORKER_TASK_NUMBER, "two");
        let err = conf.get_usize(keys::WORKER_TASK_NUMBER, 1).unwrap_err();
        assert!(matches!(err, CommonError::ConfigurationError { .. }));
        assert!(err.to_string().contains(keys::WORKER_TASK_NUMBER));
    }

    #[test]
    fn test_deploy_mode() {
        assert_eq!(Configuration::new().deploy_mode().unwrap(), DeployMode::Local);

        let conf = Configuration::new().with(keys::DEPLOY_MODE, "cluster");
        assert_eq!(conf.deploy_mode().unwrap(), DeployMode::Cluster);

        let conf = Configuration::new().with(keys::DEPLOY_MODE, "mesos");
        assert!(conf.deploy_mode().is_err());
    }

    #[test]
    #[traced_test]
    fn test_app_id_and_user_resolution() {
        let conf = Configuration::new()
            .with(keys::APP_ID, "application_1")
            .with(keys::JOB_USER, "alice");
        assert_eq!(conf.resolve_app_id(), "application_1");
        assert_eq!(conf.resolve_user(), "alice");

        let generated = Configuration::new().resolve_app_id();
        assert!(generated.starts_with("application_"));
        assert!(logs_contain(&generated));
    }

    #[test]
    fn test_serde_as_flat_map() {
        let conf: Configuration = [(keys::PS_NUMBER, "2")].into_iter().collect();
        let json = serde_json::to_string(&conf).unwrap();
        assert_eq!(json, r#"{"psgrid.ps.number":"2"}"#);

        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conf);
    }
}
