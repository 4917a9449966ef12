// Error Taxonomy
//
// Every failure surfaces to the caller; the stop callback is the only
// side channel.

use std::fmt;

use crate::invariants::InvariantViolation;
use crate::log::StoreError;
use crate::state::StateError;

/// What is wrong with a partition's stored layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatIssue {
    /// The partition does not exist in the store.
    Missing,
    /// The structural marker cell is absent or wrong.
    MissingMarker { found: Option<String> },
    /// The header row does not carry the fixed labels.
    BadHeader,
    /// A partition the coordinator writes to has no index entry.
    Unindexed(String),
    MalformedRow { row: usize, detail: String },
}

impl fmt::Display for FormatIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatIssue::Missing => write!(f, "partition does not exist"),
            FormatIssue::MissingMarker { found: Some(cell) } => {
                write!(f, "structural marker missing (found {cell:?})")
            }
            FormatIssue::MissingMarker { found: None } => write!(f, "structural marker missing"),
            FormatIssue::BadHeader => write!(f, "header row does not match the log layout"),
            FormatIssue::Unindexed(name) => write!(f, "partition `{name}` has no index entry"),
            FormatIssue::MalformedRow { row, detail } => write!(f, "row {row}: {detail}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot reach backing store: {0}")]
    Connectivity(#[source] StoreError),

    #[error("unexpected format for `{partition}`: {issue}")]
    Format { partition: String, issue: FormatIssue },

    #[error("advisory lock lost: expected token {expected}, found {found}")]
    LockConflict { expected: String, found: String },

    #[error("append of {rows} rows to `{partition}` failed: {reason}")]
    AppendFailure {
        partition: String,
        rows: usize,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("prompt log is stopped")]
    Stopped,

    #[error("prompt log is not initialized")]
    NotInitialized,
}

impl LogError {
    pub(crate) fn format(partition: impl Into<String>, issue: FormatIssue) -> Self {
        LogError::Format {
            partition: partition.into(),
            issue,
        }
    }

    /// Errors after which this instance must not mutate the store again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::LockConflict { .. }
                | LogError::Format { .. }
                | LogError::Connectivity(_)
                | LogError::Invariant(_)
        )
    }
}
