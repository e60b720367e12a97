//! Common test utilities and helpers for integration tests

use async_trait::async_trait;
use psgrid_common::{Configuration, keys};
use psgrid_core::{
    InProcessMasterClient, Location, Master, MasterConfig, SplitInfo, TaskContext, TaskFactory,
    TaskId, TaskRunner, Worker, WorkerAttemptId, WorkerGroupId,
};
use std::sync::Arc;
use std::time::Duration;

/// Runs until the worker cancels its tasks.
pub struct UntilCancelled;

#[async_trait]
impl TaskRunner for UntilCancelled {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        ctx.cancelled().await;
        Ok(())
    }
}

/// Advances its clock once per split, then finishes.
pub struct ReadSplits;

#[async_trait]
impl TaskRunner for ReadSplits {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        for _ in ctx.splits() {
            ctx.clock_tick();
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

pub fn until_cancelled() -> Arc<dyn TaskFactory> {
    Arc::new(|_: TaskId| -> anyhow::Result<Box<dyn TaskRunner>> { Ok(Box::new(UntilCancelled)) })
}

#[allow(dead_code)] // Not every test binary reads splits
pub fn read_splits() -> Arc<dyn TaskFactory> {
    Arc::new(|_: TaskId| -> anyhow::Result<Box<dyn TaskRunner>> { Ok(Box::new(ReadSplits)) })
}

/// Create test splits of 64 bytes each
pub fn create_test_splits(n: usize) -> Vec<SplitInfo> {
    (0..n).map(|i| SplitInfo::new(i, i as u64 * 64, 64)).collect()
}

/// Create a master for `groups` groups of `size` workers
pub fn create_test_master(groups: u32, size: u32, splits: usize) -> Arc<Master> {
    let config = MasterConfig {
        worker_groups: groups,
        workers_per_group: size,
        lease_timeout: Duration::from_secs(1),
        ..MasterConfig::default()
    };
    Arc::new(Master::new(
        config,
        Location::localhost(7077),
        create_test_splits(splits),
    ))
}

pub fn worker_conf(tasks: usize) -> Arc<Configuration> {
    Arc::new(
        Configuration::new()
            .with(keys::WORKER_TASK_NUMBER, tasks)
            .with(keys::WORKER_HEARTBEAT_INTERVAL_MS, 50)
            .with(keys::APP_ID, "application_test"),
    )
}

/// Build a worker for `attempt` wired to `master` in process
pub fn create_test_worker(
    master: &Arc<Master>,
    attempt: WorkerAttemptId,
    tasks: usize,
    factory: Arc<dyn TaskFactory>,
) -> Worker {
    let group = master
        .worker_group(attempt.group_id())
        .unwrap_or_else(|| panic!("no group {}", attempt.group_id()));
    Worker::new(
        attempt,
        worker_conf(tasks),
        Location::localhost(9000 + attempt.worker_id().index() as u16),
        group,
        Arc::new(InProcessMasterClient::new(Arc::clone(master))),
        factory,
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn group(n: u32) -> WorkerGroupId {
    WorkerGroupId::new(n)
}
