// JSON File Store
//
// A workbook persisted as one JSON file. Nothing is cached between calls:
// reads parse the file afresh, and every mutating primitive runs
// load -> apply -> persist on a freshly read workbook while holding an
// exclusive lock on a `.lock` sibling. Several processes can therefore
// share one file and still see each other's lock claims and rows.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use promptlog_kernel::log::{
    CellRange, InMemoryStore, RemoteStore, StoreError, StructuralReply, StructuralRequest, Workbook,
};

use crate::safe_io::{atomic_write, FileLock};

pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    title: String,
}

impl JsonFileStore {
    /// Open `path`. A missing file reads as an empty workbook titled after
    /// the file stem; a corrupt one is rejected up front.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prompt-log".into());
        let lock_path = path.with_extension("lock");
        let store = Self {
            path,
            lock_path,
            title,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<Workbook, StoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Workbook::new(self.title.clone()))
            }
            Err(e) => return Err(unavailable(&self.path, e)),
        };
        serde_json::from_str(&data)
            .map_err(|e| StoreError::Rejected(format!("{}: {e}", self.path.display())))
    }

    fn persist(&self, workbook: &Workbook) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec_pretty(workbook).map_err(|e| StoreError::Rejected(e.to_string()))?;
        atomic_write(&self.path, &json).map_err(|e| unavailable(&self.path, e))
    }

    /// Apply `op` to the current file contents and persist the result.
    /// Nothing is written when `op` fails.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut InMemoryStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = FileLock::acquire(&self.lock_path).map_err(|e| unavailable(&self.lock_path, e))?;
        let mut memory = InMemoryStore::from_workbook(self.load()?);
        let out = op(&mut memory)?;
        self.persist(&memory.workbook())?;
        Ok(out)
    }

    fn snapshot(&self) -> Result<InMemoryStore, StoreError> {
        Ok(InMemoryStore::from_workbook(self.load()?))
    }
}

fn unavailable(path: &Path, err: io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {err}", path.display()))
}

impl RemoteStore for JsonFileStore {
    fn describe(&self) -> Result<String, StoreError> {
        self.snapshot()?.describe()
    }

    fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        self.snapshot()?.read_range(range)
    }

    fn overwrite_range(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.mutate(|memory| memory.overwrite_range(range, rows))
    }

    fn append_rows(&mut self, range: &CellRange, rows: &[Vec<String>]) -> Result<usize, StoreError> {
        self.mutate(|memory| memory.append_rows(range, rows))
    }

    fn apply_structural_change(
        &mut self,
        requests: &[StructuralRequest],
    ) -> Result<StructuralReply, StoreError> {
        self.mutate(|memory| memory.apply_structural_change(requests))
    }
}
