// Index Invariant Framework
//
// Invariants are pure rules over an index transition: the last index an
// instance read or wrote, and the remote index it reloads before the next
// batch. Violations are detected *before* anything is written back.

use crate::index::IndexMetadata;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// One index transition, as seen by the invariants.
#[derive(Debug, Clone, Copy)]
pub struct IndexTransition<'a> {
    pub previous: &'a IndexMetadata,
    pub next: &'a IndexMetadata,
    pub active: &'a str,
    /// Rows this instance wrote between `previous` and `next`.
    pub batch_len: usize,
    pub capacity: usize,
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, transition: &IndexTransition<'_>) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine preloaded with the rules every finalize must satisfy.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(RowCountsNeverDecrease);
        engine.register(DirectoryIsAppendOnly);
        engine.register(RotationSlackBounded);
        engine
    }

    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(&self, transition: &IndexTransition<'_>) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(transition) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// A partition's row count only grows.
pub struct RowCountsNeverDecrease;

impl Invariant for RowCountsNeverDecrease {
    fn name(&self) -> &'static str {
        "row-counts-never-decrease"
    }

    fn validate(&self, t: &IndexTransition<'_>) -> InvariantResult {
        for before in &t.previous.partitions {
            if let Some(after) = t.next.find(&before.name) {
                if after.row_count < before.row_count {
                    return InvariantResult::Fail(format!(
                        "`{}` went from {} to {} rows",
                        before.name, before.row_count, after.row_count
                    ));
                }
            }
        }
        InvariantResult::Pass
    }
}

/// Partitions are never dropped or reordered.
pub struct DirectoryIsAppendOnly;

impl Invariant for DirectoryIsAppendOnly {
    fn name(&self) -> &'static str {
        "directory-is-append-only"
    }

    fn validate(&self, t: &IndexTransition<'_>) -> InvariantResult {
        let prefix_kept = t.next.partitions.len() >= t.previous.partitions.len()
            && t
                .previous
                .partitions
                .iter()
                .zip(&t.next.partitions)
                .all(|(a, b)| a.name == b.name);
        if prefix_kept {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail("existing partitions were removed or reordered".into())
        }
    }
}

/// Rotation happens at batch boundaries, so the active partition may
/// overshoot capacity by at most one batch less one row. A partition that
/// was already past the bound may stay there but must not grow.
pub struct RotationSlackBounded;

impl Invariant for RotationSlackBounded {
    fn name(&self) -> &'static str {
        "rotation-slack-bounded"
    }

    fn validate(&self, t: &IndexTransition<'_>) -> InvariantResult {
        // a missing entry is the directory rule's concern
        let Some(active) = t.next.find(t.active) else {
            return InvariantResult::Pass;
        };
        let before = t.previous.find(t.active).map_or(0, |p| p.row_count);
        let bound = (t.capacity + t.batch_len).saturating_sub(1);
        if active.row_count > before && active.row_count > bound {
            InvariantResult::Fail(format!(
                "`{}` holds {} rows, bound is {}",
                active.name, active.row_count, bound
            ))
        } else {
            InvariantResult::Pass
        }
    }
}
