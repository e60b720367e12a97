//! Process-scoped context of a worker.
//!
//! Built once at worker startup and handed to the components that need it.
//! Every field except the metrics is fixed at construction.

use super::Worker;
use crate::data_block::DataBlockManager;
use crate::error::Result;
use crate::ids::{WorkerAttemptId, WorkerGroupId, WorkerId};
use crate::ps_agent::PSAgent;
use crate::task::TaskManager;
use crate::types::Location;
use psgrid_common::{CommonError, Configuration, DeployMode};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

pub struct WorkerContext {
    app_id: String,
    deploy_mode: DeployMode,
    conf: Arc<Configuration>,
    user: String,
    worker: Arc<Worker>,
    metrics: RwLock<HashMap<String, String>>,
}

/// Builder for [`WorkerContext`].
///
/// Application id, deploy mode and user default to what the worker's
/// configuration resolves to.
pub struct WorkerContextBuilder {
    worker: Arc<Worker>,
    app_id: Option<String>,
    deploy_mode: Option<DeployMode>,
    user: Option<String>,
}

impl WorkerContextBuilder {
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn deploy_mode(mut self, mode: DeployMode) -> Self {
        self.deploy_mode = Some(mode);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn build(self) -> Arc<WorkerContext> {
        let conf = Arc::clone(self.worker.get_conf());
        let deploy_mode = self
            .deploy_mode
            .unwrap_or(self.worker.get_config().deploy_mode);
        let app_id = self.app_id.unwrap_or_else(|| conf.resolve_app_id());
        let user = self.user.unwrap_or_else(|| conf.resolve_user());

        Arc::new(WorkerContext {
            app_id,
            deploy_mode,
            conf,
            user,
            worker: self.worker,
            metrics: RwLock::new(HashMap::new()),
        })
    }
}

impl WorkerContext {
    pub fn builder(worker: Arc<Worker>) -> WorkerContextBuilder {
        WorkerContextBuilder {
            worker,
            app_id: None,
            deploy_mode: None,
            user: None,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn deploy_mode(&self) -> DeployMode {
        self.deploy_mode
    }

    pub fn conf(&self) -> &Configuration {
        &self.conf
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn location(&self) -> &Location {
        self.worker.get_location()
    }

    pub fn worker_group_id(&self) -> WorkerGroupId {
        self.worker.get_worker_group_id()
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker.get_worker_id()
    }

    pub fn worker_attempt_id(&self) -> WorkerAttemptId {
        self.worker.get_worker_attempt_id()
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        self.worker.get_task_manager()
    }

    pub fn data_block_manager(&self) -> &Arc<DataBlockManager> {
        self.worker.get_data_block_manager()
    }

    pub fn ps_agent(&self) -> &Arc<PSAgent> {
        self.worker.get_ps_agent()
    }

    pub fn set_metric(&self, key: impl Into<String>, value: impl ToString) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.to_string());
    }

    pub fn metric(&self, key: &str) -> Option<String> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Owned copy of the metrics, sorted by key.
    pub fn metrics_snapshot(&self) -> BTreeMap<String, String> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Publish the task manager's counters as metrics.
    pub fn refresh_task_metrics(&self) {
        let tasks = self.task_manager();
        self.set_metric("task.num", tasks.task_count());
        self.set_metric("task.active", tasks.running_task_count());
        self.set_metric("task.min_clock", tasks.min_clock());
    }

    pub fn metrics_json(&self) -> Result<String> {
        serde_json::to_string(&self.metrics_snapshot()).map_err(|e| {
            CommonError::internal_error_with_source("failed to encode worker metrics", e).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::master::Master;
    use crate::ps_agent::InProcessMasterClient;
    use crate::task::{TaskContext, TaskFactory, TaskId, TaskRunner};
    use async_trait::async_trait;
    use psgrid_common::keys;

    struct Idle;

    #[async_trait]
    impl TaskRunner for Idle {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
            ctx.cancelled().await;
            Ok(())
        }
    }

    async fn worker(conf: Configuration) -> Arc<Worker> {
        let master = Arc::new(Master::new(
            MasterConfig::default(),
            Location::localhost(7000),
            Vec::new(),
        ));
        let attempt = master
            .allocate_worker_attempt("Worker_0_0".parse().unwrap())
            .await
            .unwrap();
        let factory: Arc<dyn TaskFactory> =
            Arc::new(|_: TaskId| -> anyhow::Result<Box<dyn TaskRunner>> { Ok(Box::new(Idle)) });
        Arc::new(
            Worker::new(
                attempt,
                Arc::new(conf),
                Location::new("10.0.0.5", 9000),
                master.worker_group(WorkerGroupId::new(0)).unwrap(),
                Arc::new(InProcessMasterClient::new(master)),
                factory,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fields_come_from_worker_and_configuration() {
        let conf = Configuration::new()
            .with(keys::APP_ID, "application_42")
            .with(keys::JOB_USER, "alice")
            .with(keys::DEPLOY_MODE, "CLUSTER");
        let ctx = WorkerContext::builder(worker(conf).await).build();

        assert_eq!(ctx.app_id(), "application_42");
        assert_eq!(ctx.user(), "alice");
        assert_eq!(ctx.deploy_mode(), DeployMode::Cluster);
        assert_eq!(ctx.worker_attempt_id().to_string(), "WorkerAttempt_0_0_0");
        assert_eq!(ctx.worker_group_id().to_string(), "WorkerGroup_0");
        assert_eq!(ctx.location(), &Location::new("10.0.0.5", 9000));
        assert_eq!(ctx.ps_agent().get_id().to_string(), "PSAgentAttempt_0_0");
    }

    #[tokio::test]
    async fn test_builder_overrides() {
        let ctx = WorkerContext::builder(worker(Configuration::new()).await)
            .app_id("application_x")
            .user("bob")
            .deploy_mode(DeployMode::Cluster)
            .build();
        assert_eq!(ctx.app_id(), "application_x");
        assert_eq!(ctx.user(), "bob");
        assert_eq!(ctx.deploy_mode(), DeployMode::Cluster);
    }

    #[tokio::test]
    async fn test_metrics_stay_mutable_after_init() {
        let worker = worker(Configuration::new().with(keys::WORKER_TASK_NUMBER, 2)).await;
        worker.init().await.unwrap();
        let ctx = WorkerContext::builder(Arc::clone(&worker)).build();

        ctx.set_metric("rows.read", 10);
        ctx.refresh_task_metrics();
        ctx.set_metric("rows.read", 25);

        assert_eq!(ctx.metric("rows.read").as_deref(), Some("25"));
        assert_eq!(ctx.metric("task.active").as_deref(), Some("2"));
        assert_eq!(
            ctx.metrics_json().unwrap(),
            r#"{"rows.read":"25","task.active":"2","task.min_clock":"0","task.num":"2"}"#
        );
        worker.cancel();
    }
}
