use std::fs;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use promptlog_kernel::index::IndexManager;
use promptlog_kernel::lock::LockToken;
use promptlog_kernel::{read_partition, LogConfig, LogEntry, LogRow, PromptLog, RemoteStore};

mod file_store;
mod safe_io;

use file_store::JsonFileStore;

/// Prompt log operator CLI
#[derive(Parser, Debug)]
#[command(name = "promptlog")]
#[command(about = "Append-only prompt transcript log over a tabular store", long_about = None)]
struct Cli {
    /// Path to config JSON
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a JSON array of log entries as one batch
    Append {
        #[arg(long)]
        entries: String,
    },

    /// Print the partition directory without claiming the lock
    Index,

    /// Print the rows of one partition without claiming the lock
    Show {
        #[arg(long)]
        partition: String,

        /// Data rows to skip after the header
        #[arg(long, default_value_t = 0)]
        from_row: usize,
    },
}

#[derive(Debug, Serialize)]
struct ShowOutput {
    partition: String,
    rows: Vec<LogRow>,
}

fn show<S: RemoteStore>(store: &S, partition: String, from_row: usize) -> Result<ShowOutput> {
    let rows = read_partition(store, &partition, from_row)?;
    Ok(ShowOutput { partition, rows })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_data = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config))?;
    let config = LogConfig::from_json(&config_data)?;
    config.validate()?;
    let Some(target) = config.store.target.clone() else {
        bail!("config has no store target");
    };
    let store = JsonFileStore::open(&target)?;

    match cli.command {
        Command::Append { entries } => {
            let data = fs::read_to_string(&entries)
                .with_context(|| format!("reading entries {entries}"))?;
            let batch: Vec<LogEntry> = serde_json::from_str(&data)?;

            let log = PromptLog::new(store, config);
            log.init(|| tracing::warn!("prompt log stopped; further appends are refused"))?;
            let receipt = log.append_batch(batch)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }

        Command::Index => {
            // a throwaway token: loading without assertion never conflicts
            let index = IndexManager::new(LockToken::generate()).load(&store, false)?;
            println!("{}", serde_json::to_string_pretty(&index)?);
        }

        Command::Show {
            partition,
            from_row,
        } => {
            let output = show(&store, partition, from_row)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptlog_kernel::index::INDEX_PARTITION;
    use promptlog_kernel::log::CellRange;

    fn entry(prompt: &str) -> LogEntry {
        LogEntry {
            model: "claude-2".into(),
            endpoint: "/anthropic/v1/messages".into(),
            prompt_raw: prompt.into(),
            prompt_flattened: prompt.into(),
            response: "ok".into(),
        }
    }

    fn lock_cell(store: &JsonFileStore) -> String {
        store.read_range(&CellRange::new(INDEX_PARTITION, 1, 2)).unwrap()[0][1].clone()
    }

    #[test]
    fn show_leaves_a_live_writer_in_charge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        let config = LogConfig::anonymous(path.display().to_string());
        let writer = PromptLog::new(JsonFileStore::open(&path).unwrap(), config);
        writer.init(|| {}).unwrap();
        let receipt = writer.append_batch(vec![entry("a"), entry("b")]).unwrap();

        let reader = JsonFileStore::open(&path).unwrap();
        let before = lock_cell(&reader);
        let output = show(&reader, receipt.partition.clone(), 1).unwrap();

        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0].prompt_flattened, "b");
        assert_eq!(lock_cell(&reader), before);
        writer.append_batch(vec![entry("c")]).unwrap();
    }

    #[test]
    fn show_on_an_empty_store_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        let store = JsonFileStore::open(&path).unwrap();

        assert!(show(&store, "Log_20240101_000000".into(), 0).is_err());
        assert!(!path.exists());
    }
}
