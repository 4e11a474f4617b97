use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use common::{LogEntry, Result};

/// Append-only trade/balance journal.
///
/// The `ExecutionEngine` is the sole writer and calls `append` synchronously
/// after every state transition, so the journal and in-memory state never
/// diverge by more than one transition. The file is never truncated or
/// rewritten; rotation is an external concern.
pub struct TradeJournal {
    path: PathBuf,
    file: File,
}

impl TradeJournal {
    /// Open (creating if absent) the journal file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Trade journal open");
        Ok(Self { path, file })
    }

    /// Write one entry and sync it to disk before returning. A failure here
    /// must surface to the caller: a transition without a journal line is
    /// worse than a stopped tick.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        writeln!(self.file, "{entry}")?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
