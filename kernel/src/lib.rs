// Prompt Log Kernel
//
// Durable, size-bounded, append-only transcript log over a remote
// tabular store.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod index;
pub mod invariants;
pub mod lock;
pub mod log;
pub mod partition;
pub mod state;

pub use config::LogConfig;
pub use coordinator::{AppendReceipt, LoadPartition, PromptLog, RowIdentity};
pub use error::{FormatIssue, LogError};
pub use log::{LogEntry, LogRow, RemoteStore};
pub use partition::read_partition;
