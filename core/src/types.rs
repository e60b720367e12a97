//! Shared types for worker/master coordination
//!
//! This module defines network locations, lifecycle states and the
//! request/response pairs exchanged across the master client boundary.

use crate::ids::{PSAttemptId, WorkerAttemptId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network address of a worker, parameter server or the master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub ip: String,
    pub port: u16,
}

impl Location {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Loopback address with the given port.
    pub fn localhost(port: u16) -> Self {
        Self::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }
}

impl From<SocketAddr> for Location {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Lifecycle of a worker (or parameter server) slot as tracked by the master.
///
/// `Unscheduled → AttemptRunning → (Succeeded | Failed → AttemptRunning | Killed)`.
/// `Succeeded` and `Killed` are terminal; `Failed` is terminal only once the
/// retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Unscheduled,
    AttemptRunning,
    Succeeded,
    Failed,
    Killed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Succeeded | WorkerState::Killed)
    }

    /// Whether the state machine permits moving to `to`.
    pub fn can_transition_to(&self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Unscheduled, AttemptRunning)
                | (AttemptRunning, Succeeded)
                | (AttemptRunning, Failed)
                | (Failed, AttemptRunning)
                | (Unscheduled, Killed)
                | (AttemptRunning, Killed)
                | (Failed, Killed)
        )
    }
}

/// Outcome of a worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterCommand {
    Success,
    /// A newer attempt exists for the same worker.
    RejectStale,
    /// The worker or its group is not part of the job plan.
    RejectUnknown,
}

/// Instruction returned to a worker on each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerCommand {
    Continue,
    /// The attempt has been superseded or the job is over.
    Shutdown,
}

/// Aggregate state of the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub attempt_id: WorkerAttemptId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub command: RegisterCommand,
    /// Global minimum clock at registration time.
    pub min_clock: u64,
    /// The master's current attempt for the worker, when known.
    pub current_attempt: Option<WorkerAttemptId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub attempt_id: WorkerAttemptId,
    /// Minimum clock across the worker's tasks.
    pub clock: u64,
    pub active_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub command: WorkerCommand,
    pub min_clock: u64,
}

/// Parameter server registration, tracked with the same attempt rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPsRequest {
    pub attempt_id: PSAttemptId,
    pub location: Location,
}
