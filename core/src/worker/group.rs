//! Worker groups and the lookup-only worker references they hold.

use crate::data_block::{SplitClassification, SplitInfo};
use crate::ids::{WorkerAttemptId, WorkerGroupId, WorkerId};
use crate::types::{Location, WorkerState};
use psgrid_common::current_timestamp_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// What a group knows about one of its workers.
///
/// The record is updated when a worker reports in; the group never uses it to
/// start, stop or restart the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
    pub worker_id: WorkerId,
    /// Last attempt that reported in
    pub attempt_id: Option<WorkerAttemptId>,
    /// Last reported address
    pub location: Option<Location>,
    pub state: WorkerState,
    /// Milliseconds since the epoch of the last report
    pub last_report: Option<u64>,
}

impl WorkerRef {
    fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            attempt_id: None,
            location: None,
            state: WorkerState::Unscheduled,
            last_report: None,
        }
    }
}

/// The workers sharing one [`WorkerGroupId`] and their split assignment.
#[derive(Debug)]
pub struct WorkerGroup {
    id: WorkerGroupId,
    workers: RwLock<BTreeMap<WorkerId, WorkerRef>>,
    splits: Arc<SplitClassification>,
}

impl WorkerGroup {
    /// Build a group of `size` workers and partition `splits` among them.
    ///
    /// The classification is computed here once and never changes afterwards.
    pub fn plan(id: WorkerGroupId, size: u32, splits: Vec<SplitInfo>) -> Self {
        let worker_ids: Vec<WorkerId> = (0..size).map(|i| WorkerId::new(id, i)).collect();
        let classification = SplitClassification::partition(id, &worker_ids, splits);
        info!(
            "Planned {} with {} workers and {} splits",
            id,
            size,
            classification.total_splits()
        );

        Self {
            id,
            workers: RwLock::new(
                worker_ids
                    .into_iter()
                    .map(|w| (w, WorkerRef::new(w)))
                    .collect(),
            ),
            splits: Arc::new(classification),
        }
    }

    pub fn get_worker_group_id(&self) -> WorkerGroupId {
        self.id
    }

    /// Current worker references, one per configured worker.
    pub fn get_worker_map(&self) -> BTreeMap<WorkerId, WorkerRef> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_worker(&self, worker: &WorkerId) -> Option<WorkerRef> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)
            .cloned()
    }

    pub fn get_splits(&self) -> Arc<SplitClassification> {
        Arc::clone(&self.splits)
    }

    pub fn size(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record that `attempt` is alive at `location`.
    ///
    /// Returns false when the worker is not part of this group or an attempt
    /// newer than `attempt` has already reported in.
    pub fn report_in(&self, attempt: WorkerAttemptId, location: Location) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = workers.get_mut(&attempt.worker_id()) else {
            return false;
        };
        if entry.attempt_id.is_some_and(|known| known > attempt) {
            debug!("Ignoring report from superseded {}", attempt);
            return false;
        }
        entry.attempt_id = Some(attempt);
        entry.location = Some(location);
        entry.state = WorkerState::AttemptRunning;
        entry.last_report = Some(current_timestamp_millis());
        true
    }

    /// Record the latest known state of a worker.
    pub fn update_state(&self, worker: &WorkerId, state: WorkerState) -> bool {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        match workers.get_mut(worker) {
            Some(entry) => {
                entry.state = state;
                entry.last_report = Some(current_timestamp_millis());
                true
            }
            None => false,
        }
    }
}
