//! Per-worker registry of tasks.
//!
//! Tasks update their own status at state transitions; monitoring paths read
//! it concurrently through the accessors below. Each read takes a consistent
//! copy of one task's status, never a half-written one.

use super::{Task, TaskContext, TaskEnv, TaskId, TaskSnapshot, TaskState};
use crate::error::{CoordinationError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};


/// Registry and launcher for the tasks of one worker attempt.
pub struct TaskManager {
    /// Configured number of tasks per worker
    expected: usize,
    /// Registered tasks
    tasks: RwLock<BTreeMap<TaskId, Arc<Task>>>,
    /// Started tasks, joined in completion order
    handles: Mutex<JoinSet<(TaskId, anyhow::Result<()>)>>,
    /// Cancels every running task
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            tasks: RwLock::new(BTreeMap::new()),
            handles: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Configured per-worker task count.
    pub fn expected_task_count(&self) -> usize {
        self.expected
    }

    /// Register a task under its id.
    pub fn register_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let id = task.id();
        if tasks.contains_key(&id) {
            return Err(CoordinationError::DuplicateTask(id));
        }
        tasks.insert(id, Arc::new(task));
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.read().get(&id).cloned()
    }

    /// Total registered tasks.
    pub fn task_count(&self) -> usize {
        self.read().len()
    }

    /// Tasks currently in the running state.
    pub fn running_tasks(&self) -> HashMap<TaskId, Arc<Task>> {
        self.read()
            .iter()
            .filter(|(_, task)| task.is_running())
            .map(|(id, task)| (*id, Arc::clone(task)))
            .collect()
    }

    pub fn running_task_count(&self) -> usize {
        self.read().values().filter(|task| task.is_running()).count()
    }

    /// True iff the configured number of tasks is registered and all run.
    pub fn is_all_task_running(&self) -> bool {
        let tasks = self.read();
        tasks.len() == self.expected && tasks.values().all(|task| task.is_running())
    }

    pub fn is_all_task_finished(&self) -> bool {
        self.read().values().all(|task| task.state().is_finished())
    }

    /// Minimum progress clock across tasks, 0 when none are registered.
    pub fn min_clock(&self) -> u64 {
        self.read().values().map(|task| task.clock()).min().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.read().values().map(|task| task.snapshot()).collect()
    }

    /// Mark every registered task running and spawn its runner.
    pub async fn start_all(&self, env: TaskEnv) {
        let tasks: Vec<Arc<Task>> = self.read().values().cloned().collect();
        let mut handles = self.handles.lock().await;

        for task in tasks {
            let Some(runner) = task.take_runner() else {
                warn!("{} was already started, skipping", task.id());
                continue;
            };
            task.advance_clock_to(env.init_min_clock);
            task.mark_running();

            let cancel = self.cancel.child_token();
            let ctx = TaskContext::new(Arc::clone(&task), env.clone(), cancel.clone());
            handles.spawn(async move {
                let id = task.id();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = runner.run(ctx) => Some(result),
                };
                match outcome {
                    Some(Ok(())) => {
                        task.finish(TaskState::Succeeded, None);
                        (id, Ok(()))
                    }
                    Some(Err(e)) => {
                        error!("{} failed: {:#}", id, e);
                        task.finish(TaskState::Failed, Some(e.to_string()));
                        (id, Err(e))
                    }
                    None => {
                        task.finish(TaskState::Killed, Some("cancelled".to_string()));
                        (id, Ok(()))
                    }
                }
            });
        }

        info!("Started {} tasks", handles.len());
    }

    /// Wait for every started task.
    ///
    /// Tasks are joined as they finish. The first failure cancels the rest,
    /// which are drained before that failure is returned.
    pub async fn wait_all(&self) -> Result<()> {
        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let mut first_failure = None;

        while let Some(joined) = handles.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((task, Err(source))) => Some(CoordinationError::TaskFailed { task, source }),
                Err(join_error) => Some(CoordinationError::Common(
                    psgrid_common::CommonError::internal_error_with_source(
                        "task panicked",
                        join_error,
                    ),
                )),
            };
            if first_failure.is_none() && failure.is_some() {
                warn!("Stopping remaining tasks after a task failure");
                self.kill_all();
                first_failure = failure;
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel every running task; tasks not yet started are marked killed.
    pub fn kill_all(&self) {
        self.cancel.cancel();
        for task in self.read().values() {
            if task.state() == TaskState::New {
                task.finish(TaskState::Killed, Some("killed before start".to_string()));
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<TaskId, Arc<Task>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }
}
