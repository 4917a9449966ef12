// Prompt Log Records
//
// Entries arrive from the request pipeline without identity; rows are
// entries that have been assigned an id and version and can be written
// to a partition as six cells.

use serde::{Deserialize, Serialize};

use crate::error::FormatIssue;

pub mod memory;
pub mod store;

pub use memory::{AppendFault, InMemoryStore, Workbook};
pub use store::{CellRange, PartitionHandle, RemoteStore, StoreError, StructuralReply, StructuralRequest};

/// Number of cells in every partition row.
pub const COLUMN_COUNT: usize = 6;

/// A transcript produced by the upstream pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub model: String,
    pub endpoint: String,
    pub prompt_raw: String,
    pub prompt_flattened: String,
    pub response: String,
}

impl LogEntry {
    /// Content key used to group repeated prompts under one id.
    pub fn fingerprint(&self) -> &str {
        &self.prompt_flattened
    }

    /// Clamp the free-text fields to at most `max_chars` characters.
    pub fn truncated(mut self, max_chars: usize) -> Self {
        truncate_chars(&mut self.prompt_raw, max_chars);
        truncate_chars(&mut self.prompt_flattened, max_chars);
        truncate_chars(&mut self.response, max_chars);
        self
    }
}

/// A row as stored in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRow {
    pub id: String,
    pub version: u32,
    pub model: String,
    pub endpoint: String,
    pub prompt_raw: String,
    pub prompt_flattened: String,
    pub response: String,
}

impl LogRow {
    pub fn from_entry(entry: LogEntry, id: String, version: u32) -> Self {
        Self {
            id,
            version,
            model: entry.model,
            endpoint: entry.endpoint,
            prompt_raw: entry.prompt_raw,
            prompt_flattened: entry.prompt_flattened,
            response: entry.response,
        }
    }

    /// The value written to the `UniqueID` column.
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.id, self.version)
    }

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.unique_id(),
            self.model.clone(),
            self.endpoint.clone(),
            self.prompt_raw.clone(),
            self.prompt_flattened.clone(),
            self.response.clone(),
        ]
    }

    /// Parse a stored row.
    ///
    /// Missing trailing cells read as empty strings (the store omits them).
    /// A `UniqueID` cell that does not end in `-<version>` yields an empty
    /// id and version 0; no reconciliation with other rows is attempted.
    pub fn from_cells(row: usize, cells: &[String]) -> Result<Self, FormatIssue> {
        if cells.len() > COLUMN_COUNT {
            return Err(FormatIssue::MalformedRow {
                row,
                detail: format!("expected at most {COLUMN_COUNT} cells, found {}", cells.len()),
            });
        }
        let cell = |i: usize| cells.get(i).cloned().unwrap_or_default();

        let (id, version) = parse_unique_id(&cell(0));
        Ok(Self {
            id,
            version,
            model: cell(1),
            endpoint: cell(2),
            prompt_raw: cell(3),
            prompt_flattened: cell(4),
            response: cell(5),
        })
    }
}

fn parse_unique_id(cell: &str) -> (String, u32) {
    match cell.rsplit_once('-') {
        Some((id, version)) if !id.is_empty() => match version.parse::<u32>() {
            Ok(v) if v > 0 => (id.to_string(), v),
            _ => (String::new(), 0),
        },
        _ => (String::new(), 0),
    }
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
    }
}

/// Process-local cache of the partition currently accepting writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivePartition {
    pub name: String,
    pub rows: Vec<LogRow>,
}

impl ActivePartition {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }
}
