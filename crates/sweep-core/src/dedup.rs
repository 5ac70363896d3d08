//! Collapsing of repeated parameter assignments.

use crate::types::{canonical_key, DedupPolicy, ParameterAssignment};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Decision for one candidate task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Keep as a new task.
    New,
    /// Fold into the existing task at this index.
    Merge(usize),
    /// Already scheduled; discard.
    Drop,
}

/// Tracks assignments seen during one run, keyed by canonical hash.
#[derive(Debug, Default)]
pub struct Deduplicator {
    policy: DedupPolicy,
    /// Canonical key -> (output directory, task index) already admitted.
    seen: HashMap<String, Vec<(PathBuf, usize)>>,
}

impl Deduplicator {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            seen: HashMap::new(),
        }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    /// Decide whether `assignment` targeting `output` becomes task `next_index`.
    pub fn admit(
        &mut self,
        assignment: &ParameterAssignment,
        output: &Path,
        next_index: usize,
    ) -> Admission {
        if self.policy == DedupPolicy::None {
            return Admission::New;
        }

        let outputs = self.seen.entry(canonical_key(assignment)).or_default();
        if let Some((_, index)) = outputs.iter().find(|(seen, _)| seen == output) {
            return match self.policy {
                DedupPolicy::Merge => Admission::Merge(*index),
                _ => Admission::Drop,
            };
        }
        outputs.push((output.to_path_buf(), next_index));
        Admission::New
    }
}
