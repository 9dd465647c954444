//! Append-only JSONL journal backing a persistent store.
//!
//! Every store write appends one line before it is applied in memory.
//! Opening a store replays the file from the top.

use super::records::{
    AgentCall, ExecutionRecord, HumanRequest, PhaseRecord, TaskRecord, Transition,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smithers_proto::{CorruptStateError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One journal line, tagged by the table it writes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum JournalEntry {
    State(Transition),
    TaskStart(TaskRecord),
    TaskComplete {
        id: String,
        completed_at: DateTime<Utc>,
        #[serde(default)]
        orphaned: bool,
    },
    Execution(ExecutionRecord),
    Phase(PhaseRecord),
    Agent(AgentCall),
    Human(HumanRequest),
    Reset {
        execution_id: String,
        at: DateTime<Utc>,
    },
}

pub(crate) struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Opens `path` for appending, creating parent directories.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Creates (or truncates) `path`.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and flushes it to the OS.
    pub(crate) fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads every entry in a journal file.
///
/// Blank lines are skipped. Any other line that does not parse is fatal.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| CorruptStateError {
            line: idx as u64 + 1,
            detail: e.to_string(),
        })?;
        entries.push(entry);
    }

    debug!(path = %path.display(), entries = entries.len(), "Journal read");
    Ok(entries)
}
