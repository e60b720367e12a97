//! Tasks run inside a worker process
//!
//! A task is one concurrently running unit of work. Its logic is supplied by a
//! [`TaskRunner`] created through a [`TaskFactory`]; this module tracks the
//! task's lifecycle and progress clock so monitoring code can read them while
//! the task runs.

pub mod manager;

pub use manager::*;

use crate::data_block::SplitInfo;
use crate::ids::WorkerAttemptId;
use async_trait::async_trait;
use psgrid_common::current_timestamp_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifier of a task, unique within one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(u32);

impl TaskId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task_{}", self.0)
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed
        )
    }
}

/// Consistent view of a task's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub start_time: Option<u64>,
    pub finish_time: Option<u64>,
    pub error_message: Option<String>,
}

/// Owned copy of a task for monitoring readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub clock: u64,
}

/// User-supplied task logic.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run the task to completion. Cancellation is signalled through `ctx`.
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

/// Creates the runner for each task of a worker.
pub trait TaskFactory: Send + Sync {
    fn create(&self, task_id: TaskId) -> anyhow::Result<Box<dyn TaskRunner>>;
}

impl<F> TaskFactory for F
where
    F: Fn(TaskId) -> anyhow::Result<Box<dyn TaskRunner>> + Send + Sync,
{
    fn create(&self, task_id: TaskId) -> anyhow::Result<Box<dyn TaskRunner>> {
        self(task_id)
    }
}

/// A registered task: identity, status and progress clock.
pub struct Task {
    id: TaskId,
    status: RwLock<TaskStatus>,
    clock: AtomicU64,
    runner: Mutex<Option<Box<dyn TaskRunner>>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("clock", &self.clock())
            .finish()
    }
}

impl Task {
    pub fn new(id: TaskId, runner: Box<dyn TaskRunner>) -> Self {
        Self {
            id,
            status: RwLock::new(TaskStatus {
                state: TaskState::New,
                start_time: None,
                finish_time: None,
                error_message: None,
            }),
            clock: AtomicU64::new(0),
            runner: Mutex::new(Some(runner)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.status().state
    }

    pub fn status(&self) -> TaskStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            status: self.status(),
            clock: self.clock(),
        }
    }

    /// Move the clock forward, e.g. after finishing an iteration.
    pub fn clock_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Start from a known cluster progress point instead of zero.
    pub(crate) fn advance_clock_to(&self, clock: u64) {
        self.clock.fetch_max(clock, Ordering::AcqRel);
    }

    /// `New → Running`. Returns false if the task was already started.
    pub(crate) fn mark_running(&self) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.state != TaskState::New {
            return false;
        }
        status.state = TaskState::Running;
        status.start_time = Some(current_timestamp_millis());
        debug!("{} is running", self.id);
        true
    }

    /// Move to a terminal state exactly once; later calls are ignored.
    pub(crate) fn finish(&self, state: TaskState, error: Option<String>) -> bool {
        debug_assert!(state.is_finished());
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.state.is_finished() {
            return false;
        }
        status.state = state;
        status.finish_time = Some(current_timestamp_millis());
        status.error_message = error;
        debug!("{} finished as {:?}", self.id, state);
        true
    }

    pub(crate) fn take_runner(&self) -> Option<Box<dyn TaskRunner>> {
        self.runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Environment shared by all tasks of a worker attempt.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    pub attempt_id: WorkerAttemptId,
    pub init_min_clock: u64,
    pub splits: Arc<Vec<SplitInfo>>,
}

/// What a running task sees of its surroundings.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    env: TaskEnv,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(task: Arc<Task>, env: TaskEnv, cancel: CancellationToken) -> Self {
        Self { task, env, cancel }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn attempt_id(&self) -> WorkerAttemptId {
        self.env.attempt_id
    }

    /// Cluster progress when this attempt started; replay may resume here.
    pub fn init_min_clock(&self) -> u64 {
        self.env.init_min_clock
    }

    /// Input splits owned by this worker.
    pub fn splits(&self) -> &[SplitInfo] {
        &self.env.splits
    }

    pub fn clock(&self) -> u64 {
        self.task.clock()
    }

    pub fn clock_tick(&self) -> u64 {
        self.task.clock_tick()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the worker cancels its tasks.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskRunner for Noop {
        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_transitions_are_one_shot() {
        let task = Task::new(TaskId::new(0), Box::new(Noop));
        assert_eq!(task.state(), TaskState::New);

        assert!(task.mark_running());
        assert!(!task.mark_running());
        assert!(task.is_running());
        assert!(task.status().start_time.is_some());

        assert!(task.finish(TaskState::Succeeded, None));
        assert!(!task.finish(TaskState::Failed, Some("late".into())));
        let status = task.status();
        assert_eq!(status.state, TaskState::Succeeded);
        assert!(status.error_message.is_none());
    }

    #[test]
    fn test_clock_only_moves_forward() {
        let task = Task::new(TaskId::new(1), Box::new(Noop));
        assert_eq!(task.clock_tick(), 1);
        task.advance_clock_to(10);
        task.advance_clock_to(3);
        assert_eq!(task.clock(), 10);
    }

    #[test]
    fn test_runner_taken_once() {
        let task = Task::new(TaskId::new(2), Box::new(Noop));
        assert!(task.take_runner().is_some());
        assert!(task.take_runner().is_none());
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_id: TaskId| -> anyhow::Result<Box<dyn TaskRunner>> { Ok(Box::new(Noop)) };
        assert!(factory.create(TaskId::new(0)).is_ok());
        assert_eq!(TaskId::new(7).to_string(), "Task_7");
    }
}
