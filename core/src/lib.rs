//! psgrid core - coordination layer of a parameter-server training runtime
//!
//! This crate tracks the identities and lifecycles of worker and
//! parameter-server attempts: the master allocates attempts and rejects stale
//! ones, workers run their tasks and register through a PS-agent, and worker
//! groups keep the split assignment both sides agree on.

pub mod config;
pub mod data_block;
pub mod error;
pub mod ids;
pub mod master;
pub mod ps_agent;
pub mod task;
pub mod types;
pub mod worker;

pub use config::{MasterConfig, WorkerConfig};
pub use data_block::{DataBlockManager, SplitClassification, SplitInfo};
pub use error::{CoordinationError, Result};
pub use ids::{
    PSAgentAttemptId, PSAttemptId, ParameterServerId, WorkerAttemptId, WorkerGroupId, WorkerId,
};
pub use master::{Master, spawn_lease_monitor};
pub use ps_agent::{InProcessMasterClient, MasterClient, PSAgent};
pub use task::{
    Task, TaskContext, TaskFactory, TaskId, TaskManager, TaskRunner, TaskSnapshot, TaskState,
};
pub use types::{JobState, Location, RegisterCommand, WorkerCommand, WorkerState};
pub use worker::{Worker, WorkerContext, WorkerExit, WorkerGroup, WorkerRef};
