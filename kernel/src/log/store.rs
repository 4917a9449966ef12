// Remote Store Contract
//
// The backing tabular store is reached only through four primitives:
// read a range, overwrite a range, append rows, apply a structural change.
// Any store implementing them is substitutable.
//
// This module defines *interfaces only*.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A rectangular, open-ended cell range: `columns` columns wide, starting
/// at `start_row` (0-based) and extending to the last populated row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRange {
    pub partition: String,
    pub start_row: usize,
    pub columns: usize,
}

impl CellRange {
    pub fn new(partition: impl Into<String>, start_row: usize, columns: usize) -> Self {
        Self {
            partition: partition.into(),
            start_row,
            columns,
        }
    }
}

/// Renders as A1 notation, e.g. `Log_20240101_120000!A2:F`.
impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = column_letter(self.columns.saturating_sub(1));
        write!(f, "{}!A{}:{}", self.partition, self.start_row + 1, last)
    }
}

fn column_letter(mut index: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Structural (non-value) changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructuralRequest {
    /// Create a partition with a fixed grid size.
    AddPartition {
        title: String,
        rows: usize,
        columns: usize,
    },
    /// Wrap text and align to the top for every cell of a partition.
    WrapCells { partition_id: u64 },
    /// Set the pixel width of columns `start..end`.
    ResizeColumns {
        partition_id: u64,
        start: usize,
        end: usize,
        pixels: u32,
    },
    /// Set the pixel height of every row from `start` on.
    ResizeRows {
        partition_id: u64,
        start: usize,
        pixels: u32,
    },
}

/// Identity of a partition created by a structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHandle {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralReply {
    pub added: Vec<PartitionHandle>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("partition not found: {0}")]
    NotFound(String),

    #[error("partition already exists: {0}")]
    AlreadyExists(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Backend for the prompt log.
///
/// Calls are blocking and carry no timeout; callers wrap the coordinator
/// with their own retry policy.
///
/// Implementations MUST:
/// - Report from `append_rows` the number of rows actually written
/// - Append after the last populated row of the target partition
/// - Fail `AddPartition` with `AlreadyExists` for a duplicate title
pub trait RemoteStore: Send {
    /// Human-readable store title. Used as the connectivity probe.
    fn describe(&self) -> Result<String, StoreError>;

    fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError>;

    fn overwrite_range(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<(), StoreError>;

    fn append_rows(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<usize, StoreError>;

    fn apply_structural_change(
        &mut self,
        requests: &[StructuralRequest],
    ) -> Result<StructuralReply, StoreError>;
}
