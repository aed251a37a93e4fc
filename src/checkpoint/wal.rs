//! Write-ahead log for checkpoint durability
//!
//! Every checkpoint is appended here, as a JSON line, before its creation is
//! acknowledged. The log is the durability floor: after a crash, replaying
//! it reconstructs any checkpoints that had not yet reached durable storage.
//!
//! Truncation is whole-log only. The store truncates once every entry is
//! confirmed persisted; there is no per-record acknowledgment.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use super::store::Checkpoint;

/// Append-only JSON-lines log of checkpoint records
pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl WriteAheadLog {
    /// Open (or create) the log at the given path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and fsync before returning
    pub fn append(&self, checkpoint: &Checkpoint) -> Result<(), std::io::Error> {
        let mut line = serde_json::to_vec(checkpoint)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Replay all records in append order
    ///
    /// Corrupted or unparseable lines are skipped with a warning rather than
    /// aborting the whole recovery.
    pub fn replay(&self) -> Result<Vec<Checkpoint>, std::io::Error> {
        // Hold the write lock so appends cannot interleave with the read
        let _file = self.file.lock();

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = vec![];

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping corrupt WAL record"
                    );
                }
            }
        }

        Ok(records)
    }

    /// Discard the entire log
    ///
    /// Only safe once all entries are confirmed persisted.
    pub fn truncate(&self) -> Result<(), std::io::Error> {
        let file = self.file.lock();
        file.set_len(0)?;
        file.sync_data()?;
        Ok(())
    }
}
