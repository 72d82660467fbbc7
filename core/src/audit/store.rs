//! Durable homes for sealed audit records.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fortress_common::audit::{AuditError, RunId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One encrypted event as it sits on disk. Only the run id and sequence
/// number are visible; both are authenticated by the cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    pub run_id: RunId,
    pub seq: u64,
    /// Hex of `nonce || ciphertext || tag`.
    pub sealed: String,
}

/// A stored line that could not be parsed back into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamagedLine {
    /// 1-based line number in the run's file.
    pub line: usize,
    /// Sequence number expected at that position.
    pub seq: u64,
    pub reason: String,
}

/// Everything a store could read back for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRun {
    pub records: Vec<SealedRecord>,
    pub damaged: Vec<DamagedLine>,
}

pub trait AuditStore: Send + Sync {
    /// Durably appends one record. Returns only after the record is flushed;
    /// a failed append leaves nothing behind.
    fn persist(&self, record: &SealedRecord) -> Result<(), AuditError>;

    /// Readable records of `run_id` in storage order, plus the lines that
    /// were skipped because they could not be parsed.
    fn load(&self, run_id: RunId) -> Result<StoredRun, AuditError>;

    /// Runs that have at least one stored record.
    fn runs(&self) -> Result<Vec<RunId>, AuditError>;

    /// Called before the first append of a run in this process, so the
    /// store can repair damage left by a crash.
    fn recover(&self, _run_id: RunId) -> Result<(), AuditError> {
        Ok(())
    }

    /// Highest sequence number in use, counting damaged lines so their
    /// numbers are not handed out again.
    fn last_seq(&self, run_id: RunId) -> Result<u64, AuditError> {
        let stored = self.load(run_id)?;
        let records = stored.records.iter().map(|r| r.seq);
        let damaged = stored.damaged.iter().map(|d| d.seq);
        Ok(records.chain(damaged).max().unwrap_or(0))
    }
}

/// One JSON-lines file per run under `dir`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }
}

impl AuditStore for FileStore {
    fn persist(&self, record: &SealedRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let path = self.path_for(record.run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let start = cut_torn_tail(&mut file, &path)?;

        if let Err(e) = file.write_all(&line).and_then(|()| file.sync_data()) {
            // The next record must not be glued onto a fragment of this one.
            if let Err(undo) = file.set_len(start) {
                warn!(path = %path.display(), error = %undo, "could not roll back failed audit write");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn load(&self, run_id: RunId) -> Result<StoredRun, AuditError> {
        let path = self.path_for(run_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoredRun::default()),
            Err(e) => return Err(e.into()),
        };

        // Lossy so a torn multi-byte tail cannot fail the whole read.
        let text = String::from_utf8_lossy(&raw);
        let torn_tail = !raw.ends_with(b"\n");
        let lines: Vec<&str> = text.lines().collect();
        let last = lines.len().saturating_sub(1);
        let mut stored = StoredRun::default();

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SealedRecord>(line) {
                Ok(record) => stored.records.push(record),
                Err(e) if torn_tail && idx == last => {
                    warn!(path = %path.display(), error = %e, "ignoring torn trailing audit record");
                }
                Err(e) => {
                    warn!(path = %path.display(), line = idx + 1, error = %e, "skipping damaged audit record");
                    stored.damaged.push(DamagedLine {
                        line: idx + 1,
                        seq: stored.records.last().map(|r| r.seq + 1).unwrap_or(1),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(stored)
    }

    fn runs(&self) -> Result<Vec<RunId>, AuditError> {
        let mut runs: Vec<RunId> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "jsonl" {
                    return None;
                }
                path.file_stem()?.to_str()?.parse::<RunId>().ok()
            })
            .collect();
        runs.sort();
        Ok(runs)
    }

    fn recover(&self, run_id: RunId) -> Result<(), AuditError> {
        let path = self.path_for(run_id);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        cut_torn_tail(&mut file, &path)?;
        Ok(())
    }
}

/// Cuts a partial trailing line so the next record starts on a fresh line.
/// Returns the file length afterwards.
fn cut_torn_tail(file: &mut File, path: &Path) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0) as u64;

    debug!(path = %path.display(), dropped = len - keep, "truncating torn audit record");
    file.set_len(keep)?;
    file.sync_data()?;
    Ok(keep)
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<RunId, Vec<SealedRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryStore {
    fn persist(&self, record: &SealedRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .entry(record.run_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load(&self, run_id: RunId) -> Result<StoredRun, AuditError> {
        Ok(StoredRun {
            records: self.records.lock().get(&run_id).cloned().unwrap_or_default(),
            damaged: Vec::new(),
        })
    }

    fn runs(&self) -> Result<Vec<RunId>, AuditError> {
        let mut runs: Vec<RunId> = self.records.lock().keys().copied().collect();
        runs.sort();
        Ok(runs)
    }
}
