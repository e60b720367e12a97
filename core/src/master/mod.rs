//! Global coordinator of the job
//!
//! The master allocates worker and parameter-server attempts, decides which
//! attempt is current for every slot, tracks the global minimum clock and
//! answers location queries. Attempts prove liveness through leases renewed
//! by registration and heartbeats; an attempt whose lease lapses is failed and
//! replaced while its slot still has attempt budget.

mod monitor;
mod slot;

pub use monitor::*;

use crate::config::MasterConfig;
use crate::data_block::{SplitInfo, balanced_sizes};
use crate::error::{CoordinationError, Result};
use crate::ids::{PSAttemptId, ParameterServerId, WorkerAttemptId, WorkerGroupId, WorkerId};
use crate::types::{
    HeartbeatRequest, HeartbeatResponse, JobState, Location, RegisterCommand, RegisterPsRequest,
    RegisterWorkerRequest, RegisterWorkerResponse, WorkerCommand, WorkerState,
};
use crate::worker::WorkerGroup;
use slot::AttemptSlot;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The job coordinator.
pub struct Master {
    config: MasterConfig,
    /// Authoritative address of the master service
    location: RwLock<Location>,
    /// Worker groups of the job plan
    groups: BTreeMap<WorkerGroupId, Arc<WorkerGroup>>,
    /// One slot per worker; the key set is fixed by the job plan
    workers: BTreeMap<WorkerId, Mutex<AttemptSlot>>,
    /// One slot per parameter server
    parameter_servers: BTreeMap<ParameterServerId, Mutex<AttemptSlot>>,
    killed: AtomicBool,
    failed: AtomicBool,
    /// Stops background loops
    shutdown: CancellationToken,
}

impl Master {
    /// Build the job plan: groups, their split assignment and all slots.
    ///
    /// `splits` are divided among groups in contiguous runs, then among the
    /// workers of each group.
    pub fn new(config: MasterConfig, location: Location, splits: Vec<SplitInfo>) -> Self {
        let mut remaining = splits.into_iter();
        let mut groups = BTreeMap::new();
        let mut workers = BTreeMap::new();

        let sizes = balanced_sizes(remaining.len(), config.worker_groups as usize);
        for (g, take) in (0..config.worker_groups).zip(sizes) {
            let group_id = WorkerGroupId::new(g);
            let group_splits: Vec<SplitInfo> = remaining.by_ref().take(take).collect();
            let group = WorkerGroup::plan(group_id, config.workers_per_group, group_splits);
            for worker in group.get_worker_map().into_keys() {
                workers.insert(
                    worker,
                    Mutex::new(AttemptSlot::new(
                        worker.to_string(),
                        config.worker_max_attempts,
                    )),
                );
            }
            groups.insert(group_id, Arc::new(group));
        }

        let parameter_servers = (0..config.ps_number)
            .map(ParameterServerId::new)
            .map(|ps| {
                (
                    ps,
                    Mutex::new(AttemptSlot::new(ps.to_string(), config.ps_max_attempts)),
                )
            })
            .collect();

        info!(
            "Master at {} planned {} groups, {} workers, {} parameter servers",
            location,
            groups.len(),
            workers.len(),
            config.ps_number
        );

        Self {
            config,
            location: RwLock::new(location),
            groups,
            workers,
            parameter_servers,
            killed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn location(&self) -> Location {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move the master service to a new address, as after a failover.
    pub fn relocate(&self, location: Location) {
        let mut current = self.location.write().unwrap_or_else(PoisonError::into_inner);
        info!("Master relocated from {} to {}", *current, location);
        *current = location;
    }

    pub fn worker_group(&self, group: WorkerGroupId) -> Option<Arc<WorkerGroup>> {
        self.groups.get(&group).cloned()
    }

    pub fn worker_groups(&self) -> impl Iterator<Item = &Arc<WorkerGroup>> {
        self.groups.values()
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.keys()
    }

    fn worker_slot(&self, worker: &WorkerId) -> Result<&Mutex<AttemptSlot>> {
        self.workers
            .get(worker)
            .ok_or(CoordinationError::UnknownWorker(*worker))
    }

    fn ps_slot(&self, ps: &ParameterServerId) -> Result<&Mutex<AttemptSlot>> {
        self.parameter_servers
            .get(ps)
            .ok_or(CoordinationError::UnknownParameterServer(*ps))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.killed.load(Ordering::Acquire) {
            Err(CoordinationError::JobKilled)
        } else {
            Ok(())
        }
    }

    /// Issue the next attempt for `worker`, superseding any running one.
    pub async fn allocate_worker_attempt(&self, worker: WorkerId) -> Result<WorkerAttemptId> {
        self.ensure_alive()?;
        let mut slot = self.worker_slot(&worker)?.lock().await;
        let allocated = self.replace(&mut slot);
        let state = slot.state();
        drop(slot);

        if let Some(group) = self.groups.get(&worker.group_id()) {
            group.update_state(&worker, state);
        }
        allocated.map(|n| WorkerAttemptId::new(worker, n))
    }

    /// Issue the next attempt for a parameter server.
    pub async fn allocate_ps_attempt(&self, ps: ParameterServerId) -> Result<PSAttemptId> {
        self.ensure_alive()?;
        let mut slot = self.ps_slot(&ps)?.lock().await;
        self.replace(&mut slot).map(|n| PSAttemptId::new(ps, n))
    }

    /// Allocate the first attempt of every unscheduled worker and PS.
    pub async fn schedule_all(&self) -> Result<(Vec<WorkerAttemptId>, Vec<PSAttemptId>)> {
        let mut ps_attempts = Vec::new();
        for ps in self.parameter_servers.keys() {
            if self.ps_slot(ps)?.lock().await.state() == WorkerState::Unscheduled {
                ps_attempts.push(self.allocate_ps_attempt(*ps).await?);
            }
        }

        let mut worker_attempts = Vec::new();
        for worker in self.workers.keys() {
            if self.worker_slot(worker)?.lock().await.state() == WorkerState::Unscheduled {
                worker_attempts.push(self.allocate_worker_attempt(*worker).await?);
            }
        }
        Ok((worker_attempts, ps_attempts))
    }

    pub async fn current_worker_attempt(&self, worker: &WorkerId) -> Option<WorkerAttemptId> {
        let slot = self.workers.get(worker)?.lock().await;
        slot.current().map(|n| WorkerAttemptId::new(*worker, n))
    }

    pub async fn current_ps_attempt(&self, ps: &ParameterServerId) -> Option<PSAttemptId> {
        let slot = self.parameter_servers.get(ps)?.lock().await;
        slot.current().map(|n| PSAttemptId::new(*ps, n))
    }

    pub async fn worker_state(&self, worker: &WorkerId) -> Option<WorkerState> {
        Some(self.workers.get(worker)?.lock().await.state())
    }

    pub async fn ps_state(&self, ps: &ParameterServerId) -> Option<WorkerState> {
        Some(self.parameter_servers.get(ps)?.lock().await.state())
    }

    /// Accept or reject a worker registration.
    ///
    /// Rejections are answers, not errors: a superseded attempt gets
    /// `RejectStale`, an attempt the master never issued gets `RejectUnknown`.
    pub async fn register_worker(&self, req: RegisterWorkerRequest) -> RegisterWorkerResponse {
        let attempt = req.attempt_id;
        let worker = attempt.worker_id();

        let Some(slot) = self.workers.get(&worker) else {
            warn!("Registration from unknown worker {}", attempt);
            return self.register_response(RegisterCommand::RejectUnknown, None, "unknown worker");
        };

        let mut slot = slot.lock().await;
        let current = slot.current().map(|n| WorkerAttemptId::new(worker, n));

        if attempt.attempt() >= slot.issued() {
            warn!("Registration from never issued attempt {}", attempt);
            return self.register_response(
                RegisterCommand::RejectUnknown,
                current,
                "attempt was never issued",
            );
        }
        if !slot.is_current_running(attempt.attempt()) {
            warn!(
                "Rejecting stale registration of {}, current is {:?}",
                attempt, current
            );
            return self.register_response(
                RegisterCommand::RejectStale,
                current,
                "a newer attempt exists",
            );
        }

        slot.mark_registered();
        drop(slot);

        if let Some(group) = self.groups.get(&worker.group_id()) {
            group.report_in(attempt, req.location.clone());
        }
        info!("Registered {} at {}", attempt, req.location);

        let min_clock = self.min_clock().await;
        RegisterWorkerResponse {
            command: RegisterCommand::Success,
            min_clock,
            current_attempt: current,
            message: String::new(),
        }
    }

    fn register_response(
        &self,
        command: RegisterCommand,
        current_attempt: Option<WorkerAttemptId>,
        message: &str,
    ) -> RegisterWorkerResponse {
        RegisterWorkerResponse {
            command,
            min_clock: 0,
            current_attempt,
            message: message.to_string(),
        }
    }

    /// Renew the lease of a running attempt and record its progress.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let attempt = req.attempt_id;
        let command = match self.workers.get(&attempt.worker_id()) {
            None => WorkerCommand::Shutdown,
            Some(slot) => {
                let mut slot = slot.lock().await;
                if slot.is_current_running(attempt.attempt()) && slot.is_registered() {
                    slot.renew();
                    slot.record_clock(req.clock);
                    debug!(
                        "Heartbeat from {} clock={} active_tasks={}",
                        attempt, req.clock, req.active_tasks
                    );
                    WorkerCommand::Continue
                } else {
                    WorkerCommand::Shutdown
                }
            }
        };

        if command == WorkerCommand::Shutdown {
            info!("Telling {} to shut down", attempt);
        }
        HeartbeatResponse {
            command,
            min_clock: self.min_clock().await,
        }
    }

    /// Record progress of a running worker attempt. Stale attempts are ignored.
    pub async fn update_clock(&self, attempt: WorkerAttemptId, clock: u64) -> bool {
        let Some(slot) = self.workers.get(&attempt.worker_id()) else {
            return false;
        };
        let mut slot = slot.lock().await;
        if slot.is_current_running(attempt.attempt()) {
            slot.record_clock(clock);
            true
        } else {
            false
        }
    }

    pub async fn register_ps(&self, req: RegisterPsRequest) -> RegisterCommand {
        let attempt = req.attempt_id;
        let Some(slot) = self.parameter_servers.get(&attempt.ps_id()) else {
            return RegisterCommand::RejectUnknown;
        };
        let mut slot = slot.lock().await;
        if attempt.attempt() >= slot.issued() {
            RegisterCommand::RejectUnknown
        } else if !slot.is_current_running(attempt.attempt()) {
            RegisterCommand::RejectStale
        } else {
            slot.mark_registered();
            info!("Registered {} at {}", attempt, req.location);
            RegisterCommand::Success
        }
    }

    pub async fn ps_heartbeat(&self, attempt: PSAttemptId, clock: u64) -> WorkerCommand {
        let Some(slot) = self.parameter_servers.get(&attempt.ps_id()) else {
            return WorkerCommand::Shutdown;
        };
        let mut slot = slot.lock().await;
        if slot.is_current_running(attempt.attempt()) && slot.is_registered() {
            slot.renew();
            slot.record_clock(clock);
            WorkerCommand::Continue
        } else {
            WorkerCommand::Shutdown
        }
    }

    /// Record the successful end of a worker attempt. Stale reports are ignored.
    pub async fn worker_done(&self, attempt: WorkerAttemptId) -> Result<()> {
        let worker = attempt.worker_id();
        let mut slot = self.worker_slot(&worker)?.lock().await;
        if !slot.is_current_running(attempt.attempt()) {
            warn!("Ignoring completion of stale {}", attempt);
            return Ok(());
        }
        slot.succeed()?;
        drop(slot);

        if let Some(group) = self.groups.get(&worker.group_id()) {
            group.update_state(&worker, WorkerState::Succeeded);
        }
        info!("{} succeeded", attempt);
        Ok(())
    }

    /// Fail a worker attempt and allocate its replacement.
    ///
    /// Returns the replacement, or `None` when the report is stale. When the
    /// budget is spent the job is marked failed and the error is returned.
    pub async fn worker_failed(
        &self,
        attempt: WorkerAttemptId,
        reason: &str,
    ) -> Result<Option<WorkerAttemptId>> {
        let worker = attempt.worker_id();
        let mut slot = self.worker_slot(&worker)?.lock().await;
        if !slot.is_current_running(attempt.attempt()) {
            debug!("Ignoring failure of stale {}: {}", attempt, reason);
            return Ok(None);
        }
        warn!("{} failed: {}", attempt, reason);
        slot.fail()?;
        let next = self.replace(&mut slot);
        let group_state = slot.state();
        drop(slot);

        if let Some(group) = self.groups.get(&worker.group_id()) {
            group.update_state(&worker, group_state);
        }
        next.map(|n| Some(WorkerAttemptId::new(worker, n)))
    }

    /// Allocate the next attempt of a slot. A slot left `Failed` without a
    /// running attempt fails the job.
    fn replace(&self, slot: &mut AttemptSlot) -> Result<u32> {
        if self.killed.load(Ordering::Acquire) {
            return Err(CoordinationError::JobKilled);
        }
        slot.allocate().inspect_err(|e| {
            if slot.state() == WorkerState::Failed {
                error!("Job failed: {}", e);
                self.failed.store(true, Ordering::Release);
            }
        })
    }

    /// Fail every running attempt whose lease lapsed and allocate replacements.
    ///
    /// Returns the replacement worker attempts.
    pub async fn expire_leases(&self) -> Vec<WorkerAttemptId> {
        let timeout = self.config.lease_timeout;
        let mut replacements = Vec::new();

        for (worker, slot) in &self.workers {
            let mut slot = slot.lock().await;
            if !slot.lease_expired(timeout) {
                continue;
            }
            let lapsed = slot.current().map(|n| WorkerAttemptId::new(*worker, n));
            warn!("Lease of {:?} expired", lapsed);
            if slot.fail().is_err() {
                continue;
            }
            match self.replace(&mut slot) {
                Ok(n) => replacements.push(WorkerAttemptId::new(*worker, n)),
                Err(_) => {
                    if let Some(group) = self.groups.get(&worker.group_id()) {
                        group.update_state(worker, WorkerState::Failed);
                    }
                }
            }
        }

        for (ps, slot) in &self.parameter_servers {
            let mut slot = slot.lock().await;
            if slot.lease_expired(timeout) && slot.fail().is_ok() {
                warn!("Lease of {} expired", ps);
                if let Ok(n) = self.replace(&mut slot) {
                    info!("Replaced {} with attempt {}", ps, n);
                }
            }
        }

        replacements
    }

    /// Minimum progress clock over running workers and parameter servers.
    pub async fn min_clock(&self) -> u64 {
        let mut min: Option<u64> = None;
        for slot in self.workers.values().chain(self.parameter_servers.values()) {
            let slot = slot.lock().await;
            if slot.state() == WorkerState::AttemptRunning && slot.is_registered() {
                min = Some(min.map_or(slot.clock(), |m| m.min(slot.clock())));
            }
        }
        min.unwrap_or(0)
    }

    /// Cancel every outstanding attempt.
    pub async fn kill_job(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Killing job");
        for (worker, slot) in &self.workers {
            slot.lock().await.kill();
            if let Some(group) = self.groups.get(&worker.group_id()) {
                group.update_state(worker, WorkerState::Killed);
            }
        }
        for slot in self.parameter_servers.values() {
            slot.lock().await.kill();
        }
        self.shutdown.cancel();
    }

    pub async fn job_state(&self) -> JobState {
        if self.killed.load(Ordering::Acquire) {
            return JobState::Killed;
        }
        if self.failed.load(Ordering::Acquire) {
            return JobState::Failed;
        }
        for slot in self.workers.values() {
            if slot.lock().await.state() != WorkerState::Succeeded {
                return JobState::Running;
            }
        }
        JobState::Succeeded
    }

    /// Token cancelled when the master stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
