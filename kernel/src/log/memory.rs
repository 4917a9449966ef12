// In-Memory Remote Store
//
// A workbook of named partitions held in memory. Clones share the same
// workbook, so several coordinators can contend for one store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::store::{
    CellRange, PartitionHandle, RemoteStore, StoreError, StructuralReply, StructuralRequest,
};

/// One partition's grid and presentation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: u64,
    pub grid_rows: usize,
    pub grid_columns: usize,
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub wrapped: bool,
    #[serde(default)]
    pub column_widths: BTreeMap<usize, u32>,
    #[serde(default)]
    pub row_height: Option<(usize, u32)>,
}

/// Serializable store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workbook {
    pub title: String,
    pub next_id: u64,
    pub sheets: BTreeMap<String, Sheet>,
}

impl Workbook {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            next_id: 1,
            sheets: BTreeMap::new(),
        }
    }

    fn sheet_by_id(&mut self, id: u64) -> Result<&mut Sheet, StoreError> {
        self.sheets
            .values_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("partition id {id}")))
    }
}

/// Failure injected into the next `append_rows` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendFault {
    /// The call succeeds but reports zero rows written.
    ZeroRows,
    /// Only the first `n` rows land.
    Partial(usize),
    /// The call fails outright.
    Error(StoreError),
}

#[derive(Debug, Default)]
struct Shared {
    workbook: Workbook,
    append_faults: VecDeque<AppendFault>,
    unreachable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryStore {
    pub fn new(title: impl Into<String>) -> Self {
        Self::from_workbook(Workbook::new(title))
    }

    pub fn from_workbook(workbook: Workbook) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                workbook,
                ..Shared::default()
            })),
        }
    }

    /// Copy of the current contents.
    pub fn workbook(&self) -> Workbook {
        self.shared.lock().workbook.clone()
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.shared.lock().workbook.sheets.keys().cloned().collect()
    }

    pub fn rows(&self, partition: &str) -> Option<Vec<Vec<String>>> {
        self.shared
            .lock()
            .workbook
            .sheets
            .get(partition)
            .map(|s| s.rows.clone())
    }

    /// Queue a fault for a future append. Faults are consumed in order.
    pub fn inject_append_fault(&self, fault: AppendFault) {
        self.shared.lock().append_faults.push_back(fault);
    }

    /// Make every call fail with `Unavailable` until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.lock().unreachable = unreachable;
    }

    /// Overwrite a single cell, bypassing the contract. Useful for
    /// simulating edits made by another writer.
    pub fn set_cell(&self, partition: &str, row: usize, column: usize, value: &str) -> Result<(), StoreError> {
        let mut shared = self.shared.lock();
        let sheet = shared
            .workbook
            .sheets
            .get_mut(partition)
            .ok_or_else(|| StoreError::NotFound(partition.to_string()))?;
        let mut cells = vec![String::new(); column + 1];
        cells[column] = value.to_string();
        write_cells(sheet, row, &[cells], column);
        Ok(())
    }
}

fn check_reachable(shared: &Shared) -> Result<(), StoreError> {
    if shared.unreachable {
        return Err(StoreError::Unavailable("store is unreachable".into()));
    }
    Ok(())
}

/// Write `rows` starting at `start`, touching only columns `from..`.
fn write_cells(sheet: &mut Sheet, start: usize, rows: &[Vec<String>], from: usize) {
    if sheet.rows.len() < start + rows.len() {
        sheet.rows.resize(start + rows.len(), Vec::new());
    }
    for (offset, values) in rows.iter().enumerate() {
        let target = &mut sheet.rows[start + offset];
        if target.len() < values.len() {
            target.resize(values.len(), String::new());
        }
        for (col, value) in values.iter().enumerate().skip(from) {
            target[col] = value.clone();
        }
    }
}

impl RemoteStore for InMemoryStore {
    fn describe(&self) -> Result<String, StoreError> {
        let shared = self.shared.lock();
        check_reachable(&shared)?;
        Ok(shared.workbook.title.clone())
    }

    fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        let shared = self.shared.lock();
        check_reachable(&shared)?;
        let sheet = shared
            .workbook
            .sheets
            .get(&range.partition)
            .ok_or_else(|| StoreError::NotFound(range.partition.clone()))?;

        Ok(sheet
            .rows
            .iter()
            .skip(range.start_row)
            .map(|row| row.iter().take(range.columns).cloned().collect())
            .collect())
    }

    fn overwrite_range(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut shared = self.shared.lock();
        check_reachable(&shared)?;
        if let Some(row) = rows.iter().find(|r| r.len() > range.columns) {
            return Err(StoreError::Rejected(format!(
                "row of {} cells does not fit {range}",
                row.len()
            )));
        }
        let sheet = shared
            .workbook
            .sheets
            .get_mut(&range.partition)
            .ok_or_else(|| StoreError::NotFound(range.partition.clone()))?;
        write_cells(sheet, range.start_row, rows, 0);
        Ok(())
    }

    fn append_rows(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<usize, StoreError> {
        let mut shared = self.shared.lock();
        check_reachable(&shared)?;
        let landed = match shared.append_faults.pop_front() {
            Some(AppendFault::ZeroRows) => return Ok(0),
            Some(AppendFault::Error(e)) => return Err(e),
            Some(AppendFault::Partial(n)) => n.min(rows.len()),
            None => rows.len(),
        };
        let sheet = shared
            .workbook
            .sheets
            .get_mut(&range.partition)
            .ok_or_else(|| StoreError::NotFound(range.partition.clone()))?;

        let end = sheet
            .rows
            .iter()
            .rposition(|r| r.iter().any(|c| !c.is_empty()))
            .map_or(0, |i| i + 1);
        sheet.rows.truncate(end);
        sheet.rows.extend(rows.iter().take(landed).cloned());
        Ok(landed)
    }

    fn apply_structural_change(
        &mut self,
        requests: &[StructuralRequest],
    ) -> Result<StructuralReply, StoreError> {
        let mut shared = self.shared.lock();
        check_reachable(&shared)?;
        let workbook = &mut shared.workbook;
        let mut reply = StructuralReply::default();

        for request in requests {
            match request {
                StructuralRequest::AddPartition { title, rows, columns } => {
                    if workbook.sheets.contains_key(title) {
                        return Err(StoreError::AlreadyExists(title.clone()));
                    }
                    let id = workbook.next_id;
                    workbook.next_id += 1;
                    workbook.sheets.insert(
                        title.clone(),
                        Sheet {
                            id,
                            grid_rows: *rows,
                            grid_columns: *columns,
                            ..Sheet::default()
                        },
                    );
                    reply.added.push(PartitionHandle {
                        id,
                        title: title.clone(),
                    });
                }
                StructuralRequest::WrapCells { partition_id } => {
                    workbook.sheet_by_id(*partition_id)?.wrapped = true;
                }
                StructuralRequest::ResizeColumns {
                    partition_id,
                    start,
                    end,
                    pixels,
                } => {
                    let sheet = workbook.sheet_by_id(*partition_id)?;
                    for col in *start..*end {
                        sheet.column_widths.insert(col, *pixels);
                    }
                }
                StructuralRequest::ResizeRows {
                    partition_id,
                    start,
                    pixels,
                } => {
                    workbook.sheet_by_id(*partition_id)?.row_height = Some((*start, *pixels));
                }
            }
        }
        Ok(reply)
    }
}
