// Partition Factory
//
// Allocates a bounded log partition, writes its header, and registers it
// in the index. The remote partition exists before the index mentions it,
// and the index write completes before the partition accepts appends.
// A crash in between leaves an orphan partition with no index entry.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::PartitionConfig;
use crate::error::{FormatIssue, LogError};
use crate::index::{IndexManager, IndexMetadata, PartitionRef};
use crate::log::{
    ActivePartition, CellRange, LogRow, RemoteStore, StoreError, StructuralRequest, COLUMN_COUNT,
};

pub const HEADER: [&str; COLUMN_COUNT] = [
    "UniqueID",
    "model",
    "endpoint",
    "prompt json",
    "prompt string",
    "response",
];

/// Attempts at finding an unused partition name.
const NAME_ATTEMPTS: usize = 8;

pub fn partition_name(now: DateTime<Utc>) -> String {
    format!("Log_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Range covering data rows of `partition`, starting `from_row` rows past
/// the header.
pub fn data_range(partition: &str, from_row: usize) -> CellRange {
    CellRange::new(partition, 1 + from_row, COLUMN_COUNT)
}

pub fn header_range(partition: &str) -> CellRange {
    CellRange::new(partition, 0, COLUMN_COUNT)
}

pub fn header_row() -> Vec<String> {
    HEADER.iter().map(|h| h.to_string()).collect()
}

/// Read a partition's rows, skipping the first `from_row` data rows.
///
/// Touches neither the index nor the lock cell, so it is safe to run
/// against a store another instance is writing to.
pub fn read_partition<S: RemoteStore + ?Sized>(
    store: &S,
    partition: &str,
    from_row: usize,
) -> Result<Vec<LogRow>, LogError> {
    let values = match store.read_range(&header_range(partition)) {
        Ok(values) => values,
        Err(StoreError::NotFound(_)) => return Err(LogError::format(partition, FormatIssue::Missing)),
        Err(e) => return Err(e.into()),
    };
    parse_partition(partition, &values, from_row)
}

/// Parse stored partition rows (header included) into log rows, skipping
/// the first `from_row` data rows.
pub fn parse_partition(
    partition: &str,
    values: &[Vec<String>],
    from_row: usize,
) -> Result<Vec<LogRow>, LogError> {
    let header = values.first().map(Vec::as_slice).unwrap_or_default();
    if header != header_row().as_slice() {
        return Err(LogError::format(partition, FormatIssue::BadHeader));
    }
    values
        .iter()
        .enumerate()
        .skip(1 + from_row)
        .map(|(i, cells)| LogRow::from_cells(i, cells).map_err(|issue| LogError::format(partition, issue)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PartitionFactory {
    capacity: usize,
    format: bool,
}

impl PartitionFactory {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            capacity: config.capacity,
            format: config.format,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create a partition, register it in `index`, and persist the index.
    pub fn create<S: RemoteStore + ?Sized>(
        &self,
        store: &mut S,
        manager: &IndexManager,
        index: &mut IndexMetadata,
        now: DateTime<Utc>,
    ) -> Result<ActivePartition, LogError> {
        let (name, partition_id) = self.allocate(store, index, now)?;
        info!(partition = %name, "creating new log partition");

        store.overwrite_range(&header_range(&name), &[header_row()])?;
        if self.format {
            store.apply_structural_change(&formatting(partition_id))?;
        }

        index.partitions.push(PartitionRef {
            name: name.clone(),
            created_at: now,
            row_count: 0,
        });
        manager.write(store, index)?;

        Ok(ActivePartition::empty(name))
    }

    fn allocate<S: RemoteStore + ?Sized>(
        &self,
        store: &mut S,
        index: &IndexMetadata,
        now: DateTime<Utc>,
    ) -> Result<(String, u64), LogError> {
        let base = partition_name(now);
        let candidates = std::iter::once(base.clone())
            .chain((2..).map(|n| format!("{base}_{n}")))
            .filter(|name| index.find(name).is_none())
            .take(NAME_ATTEMPTS);

        let mut last_err = StoreError::AlreadyExists(base.clone());
        for name in candidates {
            let request = StructuralRequest::AddPartition {
                title: name.clone(),
                rows: self.capacity + 1,
                columns: COLUMN_COUNT,
            };
            match store.apply_structural_change(&[request]) {
                Ok(reply) => {
                    let id = reply.added.first().map(|h| h.id).ok_or_else(|| {
                        StoreError::Rejected(format!("no partition handle returned for {name}"))
                    })?;
                    return Ok((name, id));
                }
                Err(StoreError::AlreadyExists(existing)) => {
                    warn!(partition = %existing, "partition name taken; trying next");
                    last_err = StoreError::AlreadyExists(existing);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.into())
    }
}

/// Presentational formatting. Not semantically required.
fn formatting(partition_id: u64) -> Vec<StructuralRequest> {
    vec![
        StructuralRequest::WrapCells { partition_id },
        StructuralRequest::ResizeColumns {
            partition_id,
            start: 3,
            end: 5,
            pixels: 500,
        },
        StructuralRequest::ResizeRows {
            partition_id,
            start: 1,
            pixels: 200,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockToken;
    use crate::log::InMemoryStore;

    fn setup() -> (InMemoryStore, IndexManager, IndexMetadata) {
        let mut store = InMemoryStore::new("test");
        let manager = IndexManager::new(LockToken::from_string("t"));
        let index = manager.bootstrap(&mut store, &FormatIssue::Missing).unwrap();
        (store, manager, index)
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn name_encodes_utc_timestamp() {
        assert_eq!(partition_name(at("2024-05-06T07:08:09.123Z")), "Log_20240506_070809");
    }

    #[test]
    fn create_writes_header_and_registers() {
        let (mut store, manager, mut index) = setup();
        let factory = PartitionFactory::new(&PartitionConfig::default());

        let active = factory
            .create(&mut store, &manager, &mut index, at("2024-05-06T07:08:09Z"))
            .unwrap();

        assert_eq!(active.name, "Log_20240506_070809");
        assert!(active.rows.is_empty());
        assert_eq!(store.rows(&active.name).unwrap(), vec![header_row()]);

        let persisted = manager.load(&store, true).unwrap();
        assert_eq!(persisted.partitions.len(), 1);
        assert_eq!(persisted.partitions[0].row_count, 0);

        let workbook = store.workbook();
        let sheet = &workbook.sheets[&active.name];
        assert_eq!(sheet.grid_rows, 2001);
        assert!(sheet.wrapped);
    }

    #[test]
    fn same_second_creations_get_distinct_names() {
        let (mut store, manager, mut index) = setup();
        let factory = PartitionFactory::new(&PartitionConfig::default());
        let now = at("2024-05-06T07:08:09Z");

        let a = factory.create(&mut store, &manager, &mut index, now).unwrap();
        let b = factory.create(&mut store, &manager, &mut index, now).unwrap();

        assert_eq!(a.name, "Log_20240506_070809");
        assert_eq!(b.name, "Log_20240506_070809_2");
    }

    #[test]
    fn orphan_partition_name_is_skipped() {
        let (mut store, manager, mut index) = setup();
        store
            .apply_structural_change(&[StructuralRequest::AddPartition {
                title: "Log_20240506_070809".into(),
                rows: 1,
                columns: 6,
            }])
            .unwrap();
        let factory = PartitionFactory::new(&PartitionConfig::default());

        let active = factory
            .create(&mut store, &manager, &mut index, at("2024-05-06T07:08:09Z"))
            .unwrap();
        assert_eq!(active.name, "Log_20240506_070809_2");
    }

    #[test]
    fn formatting_can_be_disabled() {
        let (mut store, manager, mut index) = setup();
        let config = PartitionConfig {
            format: false,
            ..PartitionConfig::default()
        };
        let active = PartitionFactory::new(&config)
            .create(&mut store, &manager, &mut index, Utc::now())
            .unwrap();

        assert!(!store.workbook().sheets[&active.name].wrapped);
    }

    #[test]
    fn reading_leaves_the_index_untouched() {
        let (mut store, manager, mut index) = setup();
        let factory = PartitionFactory::new(&PartitionConfig::default());
        let active = factory.create(&mut store, &manager, &mut index, Utc::now()).unwrap();
        store
            .append_rows(&data_range(&active.name, 0), &[vec!["a-1".into(), "m".into()]])
            .unwrap();
        let before = store.workbook();

        let rows = read_partition(&store, &active.name, 0).unwrap();

        assert_eq!((rows[0].id.as_str(), rows[0].version), ("a", 1));
        assert_eq!(store.workbook(), before);
    }

    #[test]
    fn reading_a_missing_partition_is_a_format_error() {
        let (store, _, _) = setup();
        let err = read_partition(&store, "Log_nope", 0).unwrap_err();
        assert!(matches!(err, LogError::Format { issue: FormatIssue::Missing, .. }));
    }

    #[test]
    fn header_mismatch_is_a_format_error() {
        let values = vec![vec!["nope".to_string()]];
        let err = parse_partition("Log_x", &values, 0).unwrap_err();
        assert!(matches!(err, LogError::Format { issue: FormatIssue::BadHeader, .. }));
    }
}
