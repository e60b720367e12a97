//! Split classification and the per-worker data block manager.

use crate::error::{CoordinationError, Result};
use crate::ids::{WorkerGroupId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One partition of the input dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitInfo {
    /// Position of the split in the job's input
    pub index: usize,
    /// Byte offset of the split in its source
    pub offset: u64,
    /// Length of the split in bytes
    pub length: u64,
}

impl SplitInfo {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
        }
    }
}

/// Sizes of `parts` contiguous runs covering `total` items, larger runs first.
pub(crate) fn balanced_sizes(total: usize, parts: usize) -> impl Iterator<Item = usize> {
    let (base, extra) = if parts == 0 {
        (0, 0)
    } else {
        (total / parts, total % parts)
    };
    (0..parts).map(move |i| base + usize::from(i < extra))
}

/// Which input splits belong to which worker of a group.
///
/// Workers with no splits still appear with an empty list, so every worker of
/// the group has an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitClassification {
    group: WorkerGroupId,
    assignments: BTreeMap<WorkerId, Vec<SplitInfo>>,
}

impl SplitClassification {
    /// Assign `splits` to `workers` in contiguous, balanced runs.
    ///
    /// Workers are taken in id order; the first `splits % workers` of them
    /// receive one extra split. Equal inputs always give equal outputs.
    pub fn partition(group: WorkerGroupId, workers: &[WorkerId], splits: Vec<SplitInfo>) -> Self {
        let mut workers = workers.to_vec();
        workers.sort();
        workers.dedup();

        let mut assignments = BTreeMap::new();
        if workers.is_empty() {
            return Self { group, assignments };
        }

        let sizes = balanced_sizes(splits.len(), workers.len());
        let mut remaining = splits.into_iter();
        for (worker, take) in workers.into_iter().zip(sizes) {
            let owned: Vec<SplitInfo> = remaining.by_ref().take(take).collect();
            debug!("{} owns {} splits", worker, owned.len());
            assignments.insert(worker, owned);
        }

        Self { group, assignments }
    }

    pub fn group_id(&self) -> WorkerGroupId {
        self.group
    }

    pub fn splits_for(&self, worker: &WorkerId) -> &[SplitInfo] {
        self.assignments
            .get(worker)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn assignments(&self) -> &BTreeMap<WorkerId, Vec<SplitInfo>> {
        &self.assignments
    }

    pub fn total_splits(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

/// A worker's read-only handle on its group's split classification.
#[derive(Debug, Clone)]
pub struct DataBlockManager {
    worker: WorkerId,
    classification: Arc<SplitClassification>,
}

impl DataBlockManager {
    pub fn new(worker: WorkerId, classification: Arc<SplitClassification>) -> Self {
        Self {
            worker,
            classification,
        }
    }

    pub fn get_split_classification(&self) -> Arc<SplitClassification> {
        Arc::clone(&self.classification)
    }

    /// Splits this worker must read.
    pub fn assigned_splits(&self) -> Vec<SplitInfo> {
        self.classification.splits_for(&self.worker).to_vec()
    }

    /// Fail unless this view equals the group's view.
    pub fn verify(&self, group_splits: &SplitClassification) -> Result<()> {
        let same = std::ptr::eq(Arc::as_ptr(&self.classification), group_splits)
            || *self.classification == *group_splits;
        if same {
            Ok(())
        } else {
            Err(CoordinationError::SplitAssignmentMismatch {
                group: self.classification.group_id(),
            })
        }
    }
}
