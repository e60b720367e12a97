//! The worker: one attempt of a logical worker slot
//!
//! A worker owns its task manager, its view of the split classification and
//! the PS-agent through which it talks to the master. Initialization is all
//! or nothing: any failure ends the attempt, and the master schedules a
//! replacement instead of the worker retrying in place.

pub mod context;
mod group;

pub use context::*;
pub use group::*;

use crate::config::WorkerConfig;
use crate::data_block::DataBlockManager;
use crate::error::{CoordinationError, Result};
use crate::ids::{WorkerAttemptId, WorkerGroupId, WorkerId};
use crate::ps_agent::{MasterClient, PSAgent};
use crate::task::{Task, TaskEnv, TaskFactory, TaskId, TaskManager};
use crate::types::{Location, RegisterCommand, WorkerCommand};
use psgrid_common::{CommonError, Configuration};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How [`Worker::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every task finished and the master was told
    Completed,
    /// The master told this attempt to stop
    Shutdown,
    /// Cancelled locally
    Cancelled,
}

pub struct Worker {
    attempt_id: WorkerAttemptId,
    conf: Arc<Configuration>,
    config: WorkerConfig,
    /// Bound address; fixed at startup
    location: Location,
    init_finished: AtomicBool,
    init_min_clock: OnceLock<u64>,
    task_manager: Arc<TaskManager>,
    data_block_manager: Arc<DataBlockManager>,
    ps_agent: Arc<PSAgent>,
    group: Arc<WorkerGroup>,
    factory: Arc<dyn TaskFactory>,
    cancel: CancellationToken,
}

impl Worker {
    /// Assemble a worker attempt. Nothing talks to the master until
    /// [`Worker::init`].
    pub fn new(
        attempt_id: WorkerAttemptId,
        conf: Arc<Configuration>,
        location: Location,
        group: Arc<WorkerGroup>,
        client: Arc<dyn MasterClient>,
        factory: Arc<dyn TaskFactory>,
    ) -> Result<Self> {
        if group.get_worker_group_id() != attempt_id.group_id() {
            return Err(CoordinationError::UnknownGroup(attempt_id.group_id()));
        }
        if group.get_worker(&attempt_id.worker_id()).is_none() {
            return Err(CoordinationError::UnknownWorker(attempt_id.worker_id()));
        }

        let config = WorkerConfig::from_configuration(&conf)?;
        let task_manager = Arc::new(TaskManager::new(config.task_num));
        let data_block_manager = Arc::new(DataBlockManager::new(
            attempt_id.worker_id(),
            group.get_splits(),
        ));
        let ps_agent = Arc::new(PSAgent::new(attempt_id, client, config.clone()));

        Ok(Self {
            attempt_id,
            conf,
            config,
            location,
            init_finished: AtomicBool::new(false),
            init_min_clock: OnceLock::new(),
            task_manager,
            data_block_manager,
            ps_agent,
            group,
            factory,
            cancel: CancellationToken::new(),
        })
    }

    /// Create the tasks, register with the master and start the tasks.
    ///
    /// On failure the tasks are stopped and the master is told the attempt
    /// failed, unless the attempt was rejected as stale.
    pub async fn init(&self) -> Result<()> {
        if self.is_worker_init_finished() {
            warn!("{} is already initialized", self.attempt_id);
            return Ok(());
        }

        match self.try_init().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Init of {} failed: {}", self.attempt_id, e);
                self.task_manager.kill_all();
                if !matches!(e, CoordinationError::StaleAttempt { .. }) {
                    if let Err(report) = self.ps_agent.report_failed(&e.to_string()).await {
                        warn!("Could not report failure of {}: {}", self.attempt_id, report);
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_init(&self) -> Result<()> {
        for i in 0..self.config.task_num {
            let task_id = TaskId::new(i as u32);
            let runner = self
                .factory
                .create(task_id)
                .map_err(|source| CoordinationError::TaskInstantiation {
                    task: task_id,
                    source,
                })?;
            self.task_manager.register_task(Task::new(task_id, runner))?;
        }
        debug!(
            "{} created {} tasks",
            self.attempt_id,
            self.task_manager.task_count()
        );

        let resp = self.ps_agent.worker_register(self.location.clone()).await?;
        match resp.command {
            RegisterCommand::Success => {}
            RegisterCommand::RejectStale => {
                self.cancel.cancel();
                return Err(CoordinationError::StaleAttempt {
                    presented: self.attempt_id,
                    current: resp.current_attempt.unwrap_or(self.attempt_id),
                });
            }
            command @ RegisterCommand::RejectUnknown => {
                return Err(CoordinationError::Rejected {
                    attempt: self.attempt_id,
                    command,
                });
            }
        }

        let init_min_clock = *self.init_min_clock.get_or_init(|| resp.min_clock);
        self.data_block_manager.verify(&self.group.get_splits())?;

        self.task_manager
            .start_all(TaskEnv {
                attempt_id: self.attempt_id,
                init_min_clock,
                splits: Arc::new(self.data_block_manager.assigned_splits()),
            })
            .await;

        self.init_finished.store(true, Ordering::Release);
        info!(
            "{} initialized at {} with {} tasks, init min clock {}",
            self.attempt_id,
            self.location,
            self.task_manager.task_count(),
            init_min_clock
        );
        Ok(())
    }

    /// Heartbeat the master until the tasks finish, the master orders a
    /// shutdown or the worker is cancelled.
    pub async fn run(&self) -> Result<WorkerExit> {
        if !self.is_worker_init_finished() {
            return Err(CommonError::internal_error(format!(
                "{} is not initialized",
                self.attempt_id
            ))
            .into());
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let tasks = self.task_manager.wait_all();
        tokio::pin!(tasks);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("{} cancelled", self.attempt_id);
                    self.task_manager.kill_all();
                    let _ = (&mut tasks).await;
                    return Ok(WorkerExit::Cancelled);
                }
                result = &mut tasks => {
                    return self.finish(result).await;
                }
                _ = heartbeat.tick() => {
                    if self.send_heartbeat().await == WorkerCommand::Shutdown {
                        info!("{} ordered to shut down", self.attempt_id);
                        self.task_manager.kill_all();
                        let _ = (&mut tasks).await;
                        return Ok(WorkerExit::Shutdown);
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self) -> WorkerCommand {
        let clock = self.task_manager.min_clock();
        let active = self.task_manager.running_task_count();
        match self.ps_agent.heartbeat(clock, active).await {
            Ok(resp) => resp.command,
            Err(e) => {
                // The lease covers a missed beat
                warn!("Heartbeat of {} failed: {}", self.attempt_id, e);
                WorkerCommand::Continue
            }
        }
    }

    async fn finish(&self, result: Result<()>) -> Result<WorkerExit> {
        match result {
            Ok(()) => {
                let clock = self.task_manager.min_clock();
                let active = self.task_manager.running_task_count();
                if let Err(e) = self.ps_agent.heartbeat(clock, active).await {
                    debug!("Final heartbeat of {} failed: {}", self.attempt_id, e);
                }
                self.ps_agent.report_done().await?;
                info!("{} completed", self.attempt_id);
                Ok(WorkerExit::Completed)
            }
            Err(e) => {
                error!("{} failed: {}", self.attempt_id, e);
                if let Err(report) = self.ps_agent.report_failed(&e.to_string()).await {
                    warn!("Could not report failure of {}: {}", self.attempt_id, report);
                }
                Err(e)
            }
        }
    }

    /// Stop the tasks and the heartbeat loop.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.task_manager.kill_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn get_worker_id(&self) -> WorkerId {
        self.attempt_id.worker_id()
    }

    pub fn get_worker_group_id(&self) -> WorkerGroupId {
        self.attempt_id.group_id()
    }

    pub fn get_worker_attempt_id(&self) -> WorkerAttemptId {
        self.attempt_id
    }

    pub fn is_worker_init_finished(&self) -> bool {
        self.init_finished.load(Ordering::Acquire)
    }

    /// Global minimum clock when this attempt registered; 0 before then.
    pub fn get_init_min_clock(&self) -> u64 {
        self.init_min_clock.get().copied().unwrap_or(0)
    }

    pub fn get_location(&self) -> &Location {
        &self.location
    }

    pub fn get_active_task_num(&self) -> usize {
        self.task_manager.running_task_count()
    }

    pub fn get_task_num(&self) -> usize {
        self.task_manager.task_count()
    }

    pub fn get_running_task(&self) -> HashMap<TaskId, Arc<Task>> {
        self.task_manager.running_tasks()
    }

    pub async fn get_master_location(&self) -> Result<Location> {
        self.ps_agent.get_master_location().await
    }

    pub fn get_conf(&self) -> &Arc<Configuration> {
        &self.conf
    }

    pub fn get_config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn get_task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub fn get_data_block_manager(&self) -> &Arc<DataBlockManager> {
        &self.data_block_manager
    }

    pub fn get_ps_agent(&self) -> &Arc<PSAgent> {
        &self.ps_agent
    }

    pub fn get_worker_group(&self) -> &Arc<WorkerGroup> {
        &self.group
    }
}
