// Append Coordinator
//
// `PromptLog` is the context object the request pipeline talks to. It owns
// the store handle, the advisory lock token, the cached index and the
// active partition. Calls are serialized on an internal mutex; the
// store itself offers no atomicity, so the lock is advisory only.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::LogConfig;
use crate::error::{FormatIssue, LogError};
use crate::ids::{assign_ids, IdGenerator, WordPairGenerator};
use crate::index::{IndexManager, IndexMetadata, INDEX_PARTITION};
use crate::invariants::{IndexTransition, InvariantEngine};
use crate::lock::{LockToken, StopSignal};
use crate::log::{ActivePartition, LogEntry, LogRow, RemoteStore};
use crate::partition::{data_range, read_partition, PartitionFactory};
use crate::state::{LifecycleEvent, Lifecycle, LogState};

/// Identity assigned to one appended row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIdentity {
    pub id: String,
    pub version: u32,
}

impl From<&LogRow> for RowIdentity {
    fn from(row: &LogRow) -> Self {
        Self {
            id: row.id.clone(),
            version: row.version,
        }
    }
}

/// Outcome of a successful `append_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendReceipt {
    /// Partition the batch landed in.
    pub partition: String,
    pub rows_written: usize,
    /// Row count recorded for `partition` after the batch.
    pub row_count: usize,
    /// New active partition, when the batch filled `partition`.
    pub rotated_to: Option<String>,
    pub rows: Vec<RowIdentity>,
}

/// Arguments for the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPartition {
    pub name: String,
    /// Data rows to skip after the header.
    pub from_row: usize,
}

impl LoadPartition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from_row: 0,
        }
    }
}

struct Inner<S> {
    store: S,
    config: LogConfig,
    index_manager: IndexManager,
    factory: PartitionFactory,
    invariants: InvariantEngine,
    ids: Box<dyn IdGenerator>,
    lifecycle: Lifecycle,
    index: Option<IndexMetadata>,
    active: Option<ActivePartition>,
}

pub struct PromptLog<S: RemoteStore> {
    inner: Mutex<Inner<S>>,
    signal: StopSignal,
}

impl<S: RemoteStore> PromptLog<S> {
    pub fn new(store: S, config: LogConfig) -> Self {
        Self::with_token(store, config, LockToken::generate())
    }

    pub fn with_token(store: S, config: LogConfig, token: LockToken) -> Self {
        let factory = PartitionFactory::new(&config.partitions);
        Self {
            inner: Mutex::new(Inner {
                store,
                config,
                index_manager: IndexManager::new(token),
                factory,
                invariants: InvariantEngine::standard(),
                ids: Box::new(WordPairGenerator::new()),
                lifecycle: Lifecycle::new(),
                index: None,
                active: None,
            }),
            signal: StopSignal::new(),
        }
    }

    /// Replace the id source, e.g. with a deterministic sequence.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, generator: G) -> Self {
        self.inner.get_mut().ids = Box::new(generator);
        self
    }

    pub fn with_invariants(mut self, engine: InvariantEngine) -> Self {
        self.inner.get_mut().invariants = engine;
        self
    }

    pub fn lock_token(&self) -> LockToken {
        self.inner.lock().index_manager.token().clone()
    }

    /// Connect, then load the index (claiming the lock) or bootstrap a
    /// fresh index with a first partition.
    ///
    /// A second call on a running instance is a no-op. `on_stop` runs at
    /// most once, when the instance halts irrecoverably.
    pub fn init<F>(&self, on_stop: F) -> Result<(), LogError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let result = {
            let mut inner = self.inner.lock();
            match inner.lifecycle.current_state() {
                LogState::Running => return Ok(()),
                LogState::Stopped => return Err(LogError::Stopped),
                LogState::Uninitialized => {}
            }
            self.signal.arm(on_stop);
            inner.guarded(Inner::init)
        };
        self.notify_on_fatal(result)
    }

    /// Append one batch. The caller owns retry; nothing is retried here.
    pub fn append_batch(&self, entries: Vec<LogEntry>) -> Result<AppendReceipt, LogError> {
        let result = {
            let mut inner = self.inner.lock();
            inner.lifecycle.require_running()?;
            inner.guarded(|inner| inner.append_batch(entries))
        };
        self.notify_on_fatal(result)
    }

    /// Read a partition's rows into the active cache. Returns the number
    /// of rows loaded.
    ///
    /// Not meant to run alongside live appends on the same instance.
    pub fn load_partition(&self, request: LoadPartition) -> Result<usize, LogError> {
        let mut inner = self.inner.lock();
        inner.lifecycle.require_running()?;

        let rows = read_partition(&inner.store, &request.name, request.from_row)?;
        let loaded = rows.len();
        info!(partition = %request.name, rows = loaded, "loaded log partition");

        inner.active = Some(ActivePartition {
            name: request.name,
            rows,
        });
        Ok(loaded)
    }

    /// Halt the instance and fire the stop callback if it has not run.
    pub fn stop(&self) {
        self.inner.lock().halt();
        self.signal.fire();
    }

    pub fn state(&self) -> LogState {
        self.inner.lock().lifecycle.current_state()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == LogState::Stopped
    }

    /// Last index this instance read or wrote.
    pub fn index(&self) -> Option<IndexMetadata> {
        self.inner.lock().index.clone()
    }

    pub fn active_partition(&self) -> Option<ActivePartition> {
        self.inner.lock().active.clone()
    }

    /// Tear down and hand back the store.
    pub fn shutdown(self) -> S {
        self.inner.into_inner().store
    }

    // The callback runs outside the inner mutex so it may query the log.
    fn notify_on_fatal<T>(&self, result: Result<T, LogError>) -> Result<T, LogError> {
        if matches!(&result, Err(e) if e.is_fatal()) {
            self.signal.fire();
        }
        result
    }
}

impl<S: RemoteStore> Inner<S> {
    /// Run `op`, halting the instance if it fails fatally.
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, LogError>) -> Result<T, LogError> {
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(error = %e, "irrecoverable prompt log failure");
                self.halt();
            }
        }
        result
    }

    fn halt(&mut self) {
        if self.lifecycle.current_state() != LogState::Stopped {
            warn!("stopping prompt log");
        }
        if let Err(e) = self.lifecycle.apply(LifecycleEvent::Halted) {
            error!(error = %e, "could not record halt");
        }
        self.active = None;
    }

    fn init(&mut self) -> Result<(), LogError> {
        self.config.validate()?;
        let title = self.store.describe().map_err(LogError::Connectivity)?;
        info!(store = %title, "connected to backing store");

        let index = match self.index_manager.load(&self.store, false) {
            Ok(mut index) => {
                self.index_manager.write(&mut self.store, &mut index)?;
                index
            }
            Err(LogError::Format { issue, .. }) => {
                let mut index = self.index_manager.bootstrap(&mut self.store, &issue)?;
                self.rotate(&mut index)?;
                index
            }
            Err(e) => return Err(e),
        };

        self.index = Some(index);
        self.lifecycle.apply(LifecycleEvent::Initialized)?;
        Ok(())
    }

    fn cached_index(&self) -> Result<IndexMetadata, LogError> {
        self.index.clone().ok_or(LogError::NotInitialized)
    }

    /// Create a partition, make it active, and adopt the persisted index.
    fn rotate(&mut self, index: &mut IndexMetadata) -> Result<(), LogError> {
        let active = self
            .factory
            .create(&mut self.store, &self.index_manager, index, Utc::now())?;
        self.active = Some(active);
        self.index = Some(index.clone());
        Ok(())
    }

    /// Make sure a partition with spare capacity is active, returning the
    /// index the batch is applied to.
    fn prepare(&mut self) -> Result<IndexMetadata, LogError> {
        let Some(active) = &self.active else {
            let mut index = self.cached_index()?;
            self.rotate(&mut index)?;
            return Ok(index);
        };

        let mut index = self.index_manager.load(&self.store, true)?;
        self.check_reload(&active.name, &index)?;
        match index.find(&active.name).map(|p| p.row_count) {
            Some(count) if count >= self.factory.capacity() => {
                info!(partition = %active.name, row_count = count, "active partition is full; rotating");
                self.rotate(&mut index)?;
            }
            Some(_) => self.index = Some(index.clone()),
            None => {
                warn!(partition = %active.name, "active partition has no index entry; rotating");
                self.rotate(&mut index)?;
            }
        }
        Ok(index)
    }

    /// The remote index must be a legal successor of the last index this
    /// instance read or wrote. Checked before anything is written back.
    fn check_reload(&self, active: &str, remote: &IndexMetadata) -> Result<(), LogError> {
        let Some(cached) = &self.index else {
            return Ok(());
        };
        self.invariants.evaluate(&IndexTransition {
            previous: cached,
            next: remote,
            active,
            batch_len: 0,
            capacity: self.factory.capacity(),
        })?;
        Ok(())
    }

    fn append_batch(&mut self, entries: Vec<LogEntry>) -> Result<AppendReceipt, LogError> {
        if entries.is_empty() {
            return Ok(AppendReceipt {
                partition: self.active.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
                rows_written: 0,
                row_count: 0,
                rotated_to: None,
                rows: Vec::new(),
            });
        }

        let index = self.prepare()?;
        let max_chars = self.config.partitions.max_field_chars;
        let entries: Vec<LogEntry> = entries.into_iter().map(|e| e.truncated(max_chars)).collect();
        let batch_len = entries.len();

        let active = self.active.as_ref().ok_or(LogError::NotInitialized)?;
        let partition = active.name.clone();
        let mut rows = assign_ids(&active.rows, entries, self.ids.as_mut());
        let cells: Vec<Vec<String>> = rows.iter().map(LogRow::to_cells).collect();

        info!(partition = %partition, rows = batch_len, "appending log batch");
        let written = match self.store.append_rows(&data_range(&partition, 0), &cells) {
            Ok(0) => {
                return Err(self.fail_append(partition, batch_len, "store reported zero rows written".into()))
            }
            Ok(n) => n.min(batch_len),
            Err(e) => return Err(self.fail_append(partition, batch_len, e.to_string())),
        };
        if written < batch_len {
            warn!(partition = %partition, submitted = batch_len, written, "append only partially confirmed");
        } else {
            info!(partition = %partition, rows = written, "successfully appended");
        }

        rows.truncate(written);
        let identities = rows.iter().map(RowIdentity::from).collect();
        if let Some(active) = self.active.as_mut() {
            active.rows.extend(rows);
        }

        self.finalize(index, partition, written, identities)
    }

    /// Any failed append, thrown or zero-row, abandons the partition: its
    /// remote state is unknown, so a fresh one is created.
    fn fail_append(&mut self, partition: String, rows: usize, reason: String) -> LogError {
        warn!(
            partition = %partition,
            rows,
            reason = %reason,
            "no rows confirmed by append; creating new partition"
        );
        self.active = None;
        if let Err(e) = self.cached_index().and_then(|mut index| self.rotate(&mut index)) {
            error!(error = %e, "forced rotation failed; the next append will retry it");
        }
        LogError::AppendFailure {
            partition,
            rows,
            reason,
        }
    }

    fn finalize(
        &mut self,
        mut index: IndexMetadata,
        partition: String,
        written: usize,
        rows: Vec<RowIdentity>,
    ) -> Result<AppendReceipt, LogError> {
        let entry = index
            .find_mut(&partition)
            .ok_or_else(|| LogError::format(INDEX_PARTITION, FormatIssue::Unindexed(partition.clone())))?;
        entry.row_count += written;
        let row_count = entry.row_count;

        let rotated_to = if row_count >= self.factory.capacity() {
            self.rotate(&mut index)?;
            self.active.as_ref().map(|a| a.name.clone())
        } else {
            self.index_manager.write(&mut self.store, &mut index)?;
            self.index = Some(index);
            None
        };
        info!(partition = %partition, row_count, "batch finalized");

        Ok(AppendReceipt {
            partition,
            rows_written: written,
            row_count,
            rotated_to,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequenceGenerator;
    use crate::log::{AppendFault, InMemoryStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn entry(prompt: &str) -> LogEntry {
        LogEntry {
            model: "gpt-3.5-turbo".into(),
            endpoint: "/openai/v1/chat/completions".into(),
            prompt_raw: format!("[{{\"role\":\"user\",\"content\":\"{prompt}\"}}]"),
            prompt_flattened: prompt.into(),
            response: format!("re: {prompt}"),
        }
    }

    fn running(store: &InMemoryStore, capacity: usize) -> PromptLog<InMemoryStore> {
        let log = PromptLog::new(store.clone(), LogConfig::anonymous("mem").with_capacity(capacity))
            .with_id_generator(SequenceGenerator::default());
        log.init(|| {}).unwrap();
        log
    }

    #[test]
    fn append_before_init_is_rejected() {
        let log = PromptLog::new(InMemoryStore::new("t"), LogConfig::anonymous("mem"));
        assert!(matches!(log.append_batch(vec![entry("a")]), Err(LogError::NotInitialized)));
    }

    #[test]
    fn init_validates_config_before_touching_store() {
        let store = InMemoryStore::new("t");
        let log = PromptLog::new(store.clone(), LogConfig::default());

        assert!(matches!(log.init(|| {}), Err(LogError::Config(_))));
        assert!(store.partition_names().is_empty());
        assert_eq!(log.state(), LogState::Uninitialized);
    }

    #[test]
    fn unreachable_store_is_a_connectivity_error_and_stops() {
        let store = InMemoryStore::new("t");
        store.set_unreachable(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let log = PromptLog::new(store, LogConfig::anonymous("mem"));

        let err = log.init(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(err, Err(LogError::Connectivity(_))));
        assert!(log.is_stopped());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn text_fields_are_truncated_before_write() {
        let store = InMemoryStore::new("t");
        let mut config = LogConfig::anonymous("mem");
        config.partitions.max_field_chars = 4;
        let log = PromptLog::new(store.clone(), config);
        log.init(|| {}).unwrap();

        let receipt = log.append_batch(vec![entry("abcdefgh")]).unwrap();
        let rows = store.rows(&receipt.partition).unwrap();

        assert_eq!(rows[1][4], "abcd");
        assert_eq!(rows[1][5], "re: ");
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 10);
        let before = store.workbook();

        let receipt = log.append_batch(Vec::new()).unwrap();

        assert_eq!(receipt.rows_written, 0);
        assert_eq!(store.workbook(), before);
    }

    #[test]
    fn failing_append_call_is_treated_like_zero_rows() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 10);
        let first = log.active_partition().unwrap().name;
        store.inject_append_fault(AppendFault::Error(StoreError::Unavailable("timeout".into())));

        let err = log.append_batch(vec![entry("a")]).unwrap_err();

        assert!(matches!(err, LogError::AppendFailure { rows: 1, .. }));
        assert_ne!(log.active_partition().unwrap().name, first);
        assert!(!log.is_stopped());
    }

    #[test]
    fn partial_append_records_only_confirmed_rows() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 10);
        store.inject_append_fault(AppendFault::Partial(1));

        let receipt = log.append_batch(vec![entry("a"), entry("b")]).unwrap();

        assert_eq!(receipt.rows_written, 1);
        assert_eq!(receipt.row_count, 1);
        assert_eq!(log.active_partition().unwrap().rows.len(), 1);
    }

    #[test]
    fn stop_fires_callback_once_and_blocks_appends() {
        let store = InMemoryStore::new("t");
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let log = PromptLog::new(store, LogConfig::anonymous("mem"));
        log.init(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        log.stop();
        log.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(log.append_batch(vec![entry("a")]), Err(LogError::Stopped)));
        assert!(matches!(log.init(|| {}), Err(LogError::Stopped)));
    }

    #[test]
    fn loading_a_full_partition_rotates_before_writing() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 2);
        let first = log.append_batch(vec![entry("a"), entry("b")]).unwrap();
        assert!(first.rotated_to.is_some());

        log.load_partition(LoadPartition::new(&first.partition)).unwrap();
        let receipt = log.append_batch(vec![entry("c")]).unwrap();

        assert_ne!(receipt.partition, first.partition);
        let index = log.index().unwrap();
        assert_eq!(index.find(&first.partition).unwrap().row_count, 2);
    }

    #[test]
    fn load_partition_skips_requested_rows() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 10);
        let receipt = log
            .append_batch(vec![entry("a"), entry("b"), entry("a")])
            .unwrap();

        let loaded = log
            .load_partition(LoadPartition {
                name: receipt.partition.clone(),
                from_row: 1,
            })
            .unwrap();

        assert_eq!(loaded, 2);
        let rows = log.active_partition().unwrap().rows;
        assert_eq!(rows[0].prompt_flattened, "b");
        assert_eq!((rows[1].id.as_str(), rows[1].version), ("id1", 2));
    }

    #[test]
    fn loading_unknown_partition_is_a_format_error() {
        let store = InMemoryStore::new("t");
        let log = running(&store, 10);

        let err = log.load_partition(LoadPartition::new("Log_nope")).unwrap_err();
        assert!(matches!(err, LogError::Format { issue: FormatIssue::Missing, .. }));
        assert!(!log.is_stopped());
    }
}
