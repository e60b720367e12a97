//! Identifiers for worker groups, workers, parameter servers and their attempts.
//!
//! Every identifier is a small value type with a bit-exact canonical string
//! form. `parse(id.to_string()) == id` holds for every valid id, and any other
//! string is rejected with [`CoordinationError::MalformedIdentifier`].
//!
//! | type | canonical form |
//! | --- | --- |
//! | [`WorkerGroupId`] | `WorkerGroup_<n>` |
//! | [`WorkerId`] | `Worker_<group>_<index>` |
//! | [`WorkerAttemptId`] | `WorkerAttempt_<group>_<index>_<attempt>` |
//! | [`ParameterServerId`] | `ParameterServer_<n>` |
//! | [`PSAttemptId`] | `PSAttempt_<n>_<attempt>` |
//! | [`PSAgentAttemptId`] | `PSAgentAttempt_<group>_<index>` |

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Split `input` into exactly `N` numeric components after `<prefix>_`.
fn parse_components<const N: usize>(
    input: &str,
    prefix: &str,
    kind: &'static str,
) -> Result<[u32; N]> {
    let malformed = || CoordinationError::malformed(kind, input);

    let rest = input
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or_else(malformed)?;

    let mut out = [0u32; N];
    let mut parts = rest.split('_');
    for slot in out.iter_mut() {
        let part = parts.next().ok_or_else(malformed)?;
        // u32::from_str accepts a leading '+', which is not canonical.
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        *slot = part.parse().map_err(|_| malformed())?;
    }
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(out)
}

/// Serde and `String` conversions through the canonical form.
macro_rules! string_id {
    ($ty:ty) => {
        impl TryFrom<String> for $ty {
            type Error = CoordinationError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.to_string()
            }
        }
    };
}

/// One logical shard of workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerGroupId(u32);

impl WorkerGroupId {
    pub const PREFIX: &'static str = "WorkerGroup";

    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for WorkerGroupId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [n] = parse_components::<1>(s, Self::PREFIX, "WorkerGroupId")?;
        Ok(Self(n))
    }
}

string_id!(WorkerGroupId);

/// One logical worker slot, stable across attempt restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId {
    group: WorkerGroupId,
    index: u32,
}

impl WorkerId {
    pub const PREFIX: &'static str = "Worker";

    pub fn new(group: WorkerGroupId, index: u32) -> Self {
        Self { group, index }
    }

    pub fn group_id(&self) -> WorkerGroupId {
        self.group
    }

    /// Index of the worker inside its group.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", Self::PREFIX, self.group.index(), self.index)
    }
}

impl FromStr for WorkerId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [g, i] = parse_components::<2>(s, Self::PREFIX, "WorkerId")?;
        Ok(Self::new(WorkerGroupId::new(g), i))
    }
}

string_id!(WorkerId);

/// One physical process instance running for a [`WorkerId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerAttemptId {
    worker: WorkerId,
    attempt: u32,
}

impl WorkerAttemptId {
    pub const PREFIX: &'static str = "WorkerAttempt";

    pub fn new(worker: WorkerId, attempt: u32) -> Self {
        Self { worker, attempt }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn group_id(&self) -> WorkerGroupId {
        self.worker.group_id()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The attempt that supersedes this one, `None` once numbers run out.
    pub fn next(&self) -> Option<Self> {
        self.attempt
            .checked_add(1)
            .map(|attempt| Self::new(self.worker, attempt))
    }
}

impl fmt::Display for WorkerAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            Self::PREFIX,
            self.worker.group_id().index(),
            self.worker.index(),
            self.attempt
        )
    }
}

impl FromStr for WorkerAttemptId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [g, i, a] = parse_components::<3>(s, Self::PREFIX, "WorkerAttemptId")?;
        Ok(Self::new(WorkerId::new(WorkerGroupId::new(g), i), a))
    }
}

string_id!(WorkerAttemptId);

/// One parameter-server shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterServerId(u32);

impl ParameterServerId {
    pub const PREFIX: &'static str = "ParameterServer";

    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ParameterServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for ParameterServerId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [n] = parse_components::<1>(s, Self::PREFIX, "ParameterServerId")?;
        Ok(Self(n))
    }
}

string_id!(ParameterServerId);

/// One physical process instance of a parameter server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PSAttemptId {
    ps: ParameterServerId,
    attempt: u32,
}

impl PSAttemptId {
    pub const PREFIX: &'static str = "PSAttempt";

    pub fn new(ps: ParameterServerId, attempt: u32) -> Self {
        Self { ps, attempt }
    }

    pub fn ps_id(&self) -> ParameterServerId {
        self.ps
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next(&self) -> Option<Self> {
        self.attempt
            .checked_add(1)
            .map(|attempt| Self::new(self.ps, attempt))
    }
}

impl fmt::Display for PSAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", Self::PREFIX, self.ps.index(), self.attempt)
    }
}

impl FromStr for PSAttemptId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [n, a] = parse_components::<2>(s, Self::PREFIX, "PSAttemptId")?;
        Ok(Self::new(ParameterServerId::new(n), a))
    }
}

string_id!(PSAttemptId);

/// Identity of the PS-agent serving one worker attempt.
///
/// The canonical form names the worker slot only; two attempts of the same
/// worker therefore share the rendered agent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PSAgentAttemptId {
    worker: WorkerId,
}

impl PSAgentAttemptId {
    pub const PREFIX: &'static str = "PSAgentAttempt";

    pub fn for_worker_attempt(attempt: &WorkerAttemptId) -> Self {
        Self {
            worker: attempt.worker_id(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }
}

impl fmt::Display for PSAgentAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            Self::PREFIX,
            self.worker.group_id().index(),
            self.worker.index()
        )
    }
}

impl FromStr for PSAgentAttemptId {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        let [g, i] = parse_components::<2>(s, Self::PREFIX, "PSAgentAttemptId")?;
        Ok(Self {
            worker: WorkerId::new(WorkerGroupId::new(g), i),
        })
    }
}

string_id!(PSAgentAttemptId);

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_canonical<T>(s: &str)
    where
        T: FromStr<Err = CoordinationError> + fmt::Display,
    {
        let id: T = s.parse().unwrap_or_else(|e| panic!("{s}: {e}"));
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn test_canonical_forms_round_trip() {
        assert_canonical::<WorkerGroupId>("WorkerGroup_0");
        assert_canonical::<WorkerGroupId>("WorkerGroup_17");
        assert_canonical::<WorkerId>("Worker_0_0");
        assert_canonical::<WorkerId>("Worker_3_12");
        assert_canonical::<WorkerAttemptId>("WorkerAttempt_0_0_0");
        assert_canonical::<WorkerAttemptId>("WorkerAttempt_2_5_9");
        assert_canonical::<ParameterServerId>("ParameterServer_4");
        assert_canonical::<PSAttemptId>("PSAttempt_4_1");
        assert_canonical::<PSAgentAttemptId>("PSAgentAttempt_1_2");
    }

    #[test]
    fn test_structured_construction() {
        let group = WorkerGroupId::new(0);
        let worker = WorkerId::new(group, 0);
        let attempt = WorkerAttemptId::new(worker, 0);

        assert_eq!(group.to_string(), "WorkerGroup_0");
        assert_eq!(worker.to_string(), "Worker_0_0");
        assert_eq!(attempt.to_string(), "WorkerAttempt_0_0_0");
        assert_eq!(attempt.group_id(), group);
        assert_eq!(attempt.next().unwrap().to_string(), "WorkerAttempt_0_0_1");
    }

    #[test]
    fn test_ps_agent_id_derived_from_worker_attempt() {
        let attempt: WorkerAttemptId = "WorkerAttempt_0_0_0".parse().unwrap();
        let agent = PSAgentAttemptId::for_worker_attempt(&attempt);
        assert_eq!(agent.to_string(), "PSAgentAttempt_0_0");
        assert_eq!(agent.worker_id(), attempt.worker_id());
    }

    #[test]
    fn test_malformed_strings_rejected() {
        let bad_workers = [
            "",
            "Worker",
            "Worker_",
            "Worker_0",
            "Worker_0_0_0",
            "Worker_a_0",
            "Worker_0_-1",
            "Worker_+1_0",
            "Worker_ 1_0",
            "Worker__0",
            "worker_0_0",
            "WorkerGroup_0",
            "Worker_0_99999999999",
        ];
        for s in bad_workers {
            let err = s.parse::<WorkerId>().unwrap_err();
            assert!(
                matches!(err, CoordinationError::MalformedIdentifier { .. }),
                "{s} should be malformed"
            );
        }

        assert!("WorkerAttempt_0_0".parse::<WorkerAttemptId>().is_err());
        assert!("WorkerGroup_1_2".parse::<WorkerGroupId>().is_err());
        assert!("PSAttempt_1".parse::<PSAttemptId>().is_err());
        assert!("ParameterServer_x".parse::<ParameterServerId>().is_err());
        assert!("PSAgentAttempt_0_0_0".parse::<PSAgentAttemptId>().is_err());
    }

    #[test]
    fn test_ordering_is_structural() {
        let a: WorkerId = "Worker_0_10".parse().unwrap();
        let b: WorkerId = "Worker_1_2".parse().unwrap();
        let c: WorkerId = "Worker_0_2".parse().unwrap();
        let mut ids = vec![a, b, c];
        ids.sort();
        assert_eq!(ids, vec![c, a, b]);

        let old: WorkerAttemptId = "WorkerAttempt_0_0_1".parse().unwrap();
        assert!(old < old.next().unwrap());
    }

    #[test]
    fn test_last_attempt_number_has_no_successor() {
        let last: WorkerAttemptId = "WorkerAttempt_0_0_4294967295".parse().unwrap();
        assert!(last.next().is_none());
        let last: PSAttemptId = "PSAttempt_0_4294967295".parse().unwrap();
        assert!(last.next().is_none());
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let attempt: WorkerAttemptId = "WorkerAttempt_1_2_3".parse().unwrap();
        let json = serde_json::to_string(&attempt).unwrap();
        assert_eq!(json, "\"WorkerAttempt_1_2_3\"");

        let bad = serde_json::from_str::<WorkerAttemptId>("\"WorkerAttempt_1_2\"");
        assert!(bad.is_err());
    }
}
