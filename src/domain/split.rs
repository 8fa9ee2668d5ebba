// ============================================================
// Layer 3 — Split Assignment
// ============================================================
// The result of the patient-level splitter: three disjoint
// groups of patients and the sample indices that inherit each
// group. Invariant: a patient id appears in exactly one group,
// so the three index lists are pairwise disjoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which partition a patient (and all its images) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitRole {
    Train,
    Val,
    Test,
}

impl fmt::Display for SplitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitRole::Train => write!(f, "train"),
            SplitRole::Val => write!(f, "val"),
            SplitRole::Test => write!(f, "test"),
        }
    }
}

/// Patients and sample indices of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitGroup {
    /// Sorted patient ids.
    pub patients: Vec<String>,
    /// Ascending indices into the discovered sample list.
    pub indices: Vec<usize>,
}

/// Train / validation / test partition of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub train: SplitGroup,
    pub val: SplitGroup,
    pub test: SplitGroup,
}

impl SplitAssignment {
    pub fn group(&self, role: SplitRole) -> &SplitGroup {
        match role {
            SplitRole::Train => &self.train,
            SplitRole::Val => &self.val,
            SplitRole::Test => &self.test,
        }
    }

    /// Total number of samples across all three groups.
    pub fn sample_count(&self) -> usize {
        self.train.indices.len() + self.val.indices.len() + self.test.indices.len()
    }
}
