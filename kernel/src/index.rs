// Index Manager
//
// The index partition is the directory of log partitions and the lock
// cell. Layout (range `__index__!A1:D`):
//
//   row 1   title
//   row 2   "lockId" | <token>
//   row 3   "partitionName" | "createdAt" | "rowCount"     <- structural marker
//   row 4+  one row per log partition

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::error::{FormatIssue, LogError};
use crate::lock::LockToken;
use crate::log::{CellRange, RemoteStore, StoreError, StructuralRequest};

pub const INDEX_PARTITION: &str = "__index__";

const INDEX_COLUMNS: usize = 4;
const INDEX_GRID_ROWS: usize = 1000;
const TITLE_ROW: usize = 0;
const LOCK_ROW: usize = 1;
const MARKER_ROW: usize = 2;
const FIRST_ENTRY_ROW: usize = 3;

const TITLE: &str = "Prompt log index. Managed automatically; do not edit.";
const LOCK_LABEL: &str = "lockId";
const MARKER: &str = "partitionName";

/// Directory entry for one log partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRef {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub lock_token: String,
    pub partitions: Vec<PartitionRef>,
}

impl IndexMetadata {
    pub fn empty(token: &LockToken) -> Self {
        Self {
            lock_token: token.to_string(),
            partitions: Vec::new(),
        }
    }

    pub fn find(&self, name: &str) -> Option<&PartitionRef> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut PartitionRef> {
        self.partitions.iter_mut().find(|p| p.name == name)
    }

    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(|p| p.row_count).sum()
    }

    fn to_rows(&self) -> Vec<Vec<String>> {
        let mut rows = vec![
            vec![TITLE.to_string()],
            vec![LOCK_LABEL.to_string(), self.lock_token.clone()],
            vec![MARKER.to_string(), "createdAt".to_string(), "rowCount".to_string()],
        ];
        rows.extend(self.partitions.iter().map(|p| {
            vec![
                p.name.clone(),
                p.created_at.to_rfc3339(),
                p.row_count.to_string(),
            ]
        }));
        rows
    }

    fn parse(values: &[Vec<String>]) -> Result<Self, FormatIssue> {
        let cell = |row: usize, col: usize| values.get(row).and_then(|r| r.get(col));

        match cell(MARKER_ROW, 0) {
            Some(marker) if marker == MARKER => {}
            other => {
                return Err(FormatIssue::MissingMarker {
                    found: other.cloned(),
                })
            }
        }
        let lock_token = cell(LOCK_ROW, 1).cloned().unwrap_or_default();

        let partitions = values
            .iter()
            .enumerate()
            .skip(FIRST_ENTRY_ROW)
            .filter(|(_, row)| row.first().is_some_and(|name| !name.is_empty()))
            .map(|(i, row)| parse_entry(i, row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            lock_token,
            partitions,
        })
    }
}

fn parse_entry(row: usize, cells: &[String]) -> Result<PartitionRef, FormatIssue> {
    let malformed = |detail: String| FormatIssue::MalformedRow { row, detail };
    let get = |i: usize| cells.get(i).map(String::as_str).unwrap_or_default();

    let created_at = DateTime::parse_from_rfc3339(get(1))
        .map_err(|e| malformed(format!("bad createdAt {:?}: {e}", get(1))))?
        .with_timezone(&Utc);
    let row_count = get(2)
        .parse::<usize>()
        .map_err(|e| malformed(format!("bad rowCount {:?}: {e}", get(2))))?;

    Ok(PartitionRef {
        name: get(0).to_string(),
        created_at,
        row_count,
    })
}

/// Loads and persists the index on behalf of one process instance.
#[derive(Debug, Clone)]
pub struct IndexManager {
    token: LockToken,
}

impl IndexManager {
    pub fn new(token: LockToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    fn range() -> CellRange {
        CellRange::new(INDEX_PARTITION, TITLE_ROW, INDEX_COLUMNS)
    }

    /// Read and parse the index. With `assert_lock`, a foreign token in
    /// the lock cell is a `LockConflict`.
    pub fn load<S: RemoteStore + ?Sized>(
        &self,
        store: &S,
        assert_lock: bool,
    ) -> Result<IndexMetadata, LogError> {
        info!(assert_lock, "loading index partition");
        let values = match store.read_range(&Self::range()) {
            Ok(values) => values,
            Err(StoreError::NotFound(_)) => {
                return Err(LogError::format(INDEX_PARTITION, FormatIssue::Missing))
            }
            Err(e) => return Err(e.into()),
        };

        let index = IndexMetadata::parse(&values).map_err(|issue| {
            error!(%issue, "unexpected format for index partition");
            LogError::format(INDEX_PARTITION, issue)
        })?;

        if assert_lock {
            if let Err(e) = self.token.verify(&index.lock_token) {
                error!(
                    received = %index.lock_token,
                    expected = %self.token,
                    "another instance is writing to the store"
                );
                return Err(e);
            }
        }
        Ok(index)
    }

    /// Persist `index`, stamping this instance's token into the lock cell.
    pub fn write<S: RemoteStore + ?Sized>(
        &self,
        store: &mut S,
        index: &mut IndexMetadata,
    ) -> Result<(), LogError> {
        index.lock_token = self.token.to_string();
        store.overwrite_range(&Self::range(), &index.to_rows())?;
        Ok(())
    }

    /// Recreate an empty index after `load` reported `issue`.
    ///
    /// A missing partition is created first; a malformed one is rewritten
    /// in place. Rows beyond the new directory are blanked.
    pub fn bootstrap<S: RemoteStore + ?Sized>(
        &self,
        store: &mut S,
        issue: &FormatIssue,
    ) -> Result<IndexMetadata, LogError> {
        info!(%issue, "creating new index partition");
        let stale_rows = match issue {
            FormatIssue::Missing => {
                store.apply_structural_change(&[StructuralRequest::AddPartition {
                    title: INDEX_PARTITION.to_string(),
                    rows: INDEX_GRID_ROWS,
                    columns: INDEX_COLUMNS,
                }])?;
                0
            }
            _ => store.read_range(&Self::range())?.len(),
        };

        let mut index = IndexMetadata::empty(&self.token);
        let mut rows = index.to_rows();
        while rows.len() < stale_rows {
            rows.push(vec![String::new(); INDEX_COLUMNS]);
        }
        store.overwrite_range(&Self::range(), &rows)?;
        index.lock_token = self.token.to_string();
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryStore;

    fn manager(token: &str) -> IndexManager {
        IndexManager::new(LockToken::from_string(token))
    }

    fn bootstrapped(token: &str) -> (InMemoryStore, IndexManager) {
        let mut store = InMemoryStore::new("test");
        let mgr = manager(token);
        mgr.bootstrap(&mut store, &FormatIssue::Missing).unwrap();
        (store, mgr)
    }

    #[test]
    fn missing_index_is_a_format_error() {
        let store = InMemoryStore::new("test");
        let err = manager("t").load(&store, false).unwrap_err();
        assert!(matches!(err, LogError::Format { issue: FormatIssue::Missing, .. }));
    }

    #[test]
    fn write_then_load_preserves_directory() {
        let (mut store, mgr) = bootstrapped("t");
        let mut index = mgr.load(&store, true).unwrap();
        let created_at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        index.partitions.push(PartitionRef {
            name: "Log_20240301_120000".into(),
            created_at,
            row_count: 17,
        });
        mgr.write(&mut store, &mut index).unwrap();

        let loaded = mgr.load(&store, true).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.total_rows(), 17);
    }

    #[test]
    fn foreign_token_fails_only_when_asserted() {
        let (store, _) = bootstrapped("first");
        let second = manager("second");

        assert!(second.load(&store, false).is_ok());
        let err = second.load(&store, true).unwrap_err();
        assert!(matches!(err, LogError::LockConflict { .. }));
    }

    #[test]
    fn write_claims_the_lock() {
        let (mut store, first) = bootstrapped("first");
        let second = manager("second");

        let mut index = second.load(&store, false).unwrap();
        second.write(&mut store, &mut index).unwrap();

        assert!(second.load(&store, true).is_ok());
        assert!(matches!(first.load(&store, true), Err(LogError::LockConflict { .. })));
    }

    #[test]
    fn missing_marker_is_detected_and_bootstrap_rewrites() {
        let (mut store, mgr) = bootstrapped("t");
        store.set_cell(INDEX_PARTITION, MARKER_ROW, 0, "garbage").unwrap();

        let err = mgr.load(&store, false).unwrap_err();
        let LogError::Format { issue, .. } = err else {
            panic!("expected format error");
        };
        assert!(matches!(issue, FormatIssue::MissingMarker { .. }));

        mgr.bootstrap(&mut store, &issue).unwrap();
        assert!(mgr.load(&store, true).unwrap().partitions.is_empty());
    }

    #[test]
    fn bad_row_count_is_malformed() {
        let (mut store, mgr) = bootstrapped("t");
        let range = CellRange::new(INDEX_PARTITION, FIRST_ENTRY_ROW, INDEX_COLUMNS);
        store
            .overwrite_range(
                &range,
                &[vec![
                    "Log_x".into(),
                    "2024-01-01T00:00:00Z".into(),
                    "many".into(),
                ]],
            )
            .unwrap();

        let err = mgr.load(&store, false).unwrap_err();
        assert!(matches!(
            err,
            LogError::Format { issue: FormatIssue::MalformedRow { row: 3, .. }, .. }
        ));
    }
}
