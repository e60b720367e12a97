//! Error taxonomy of the coordination core.

use crate::ids::{ParameterServerId, WorkerAttemptId, WorkerGroupId, WorkerId};
use crate::task::TaskId;
use crate::types::{RegisterCommand, WorkerState};
use psgrid_common::CommonError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while tracking identities, attempts and worker lifecycles.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Malformed {kind} identifier: '{input}'")]
    MalformedIdentifier { kind: &'static str, input: String },

    #[error("Task {0} is already registered")]
    DuplicateTask(TaskId),

    #[error("Attempt {presented} is stale, current attempt is {current}")]
    StaleAttempt {
        presented: WorkerAttemptId,
        current: WorkerAttemptId,
    },

    #[error("Registration of {attempt} did not complete within {timeout:?}")]
    RegistrationTimeout {
        attempt: WorkerAttemptId,
        timeout: Duration,
    },

    #[error("Split assignment of {group} disagrees with the worker group's view")]
    SplitAssignmentMismatch { group: WorkerGroupId },

    #[error("Unknown worker group {0}")]
    UnknownGroup(WorkerGroupId),

    #[error("Unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("Unknown parameter server {0}")]
    UnknownParameterServer(ParameterServerId),

    #[error("Failed to instantiate task {task}")]
    TaskInstantiation {
        task: TaskId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Task {task} failed")]
    TaskFailed {
        task: TaskId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Illegal transition of {worker} from {from:?} to {to:?}")]
    InvalidTransition {
        worker: String,
        from: WorkerState,
        to: WorkerState,
    },

    #[error("{worker} exhausted its retry budget after {attempts} attempts")]
    RetryBudgetExhausted { worker: String, attempts: u32 },

    #[error("Registration of {attempt} was rejected: {command:?}")]
    Rejected {
        attempt: WorkerAttemptId,
        command: RegisterCommand,
    },

    #[error("The job has been killed")]
    JobKilled,

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoordinationError {
    pub fn malformed(kind: &'static str, input: impl Into<String>) -> Self {
        Self::MalformedIdentifier {
            kind,
            input: input.into(),
        }
    }

    /// Whether the error ends the attempt that raised it.
    ///
    /// Identifier parsing failures are local to the caller and leave the
    /// attempt untouched; every other error is an attempt-level failure that
    /// the master answers by allocating a new attempt.
    pub fn is_attempt_fatal(&self) -> bool {
        !matches!(self, CoordinationError::MalformedIdentifier { .. })
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
