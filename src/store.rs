//! Single-slot durable report storage.
//!
//! The slot is one file at a fixed path. Writes go to a temp file in the same
//! directory and are renamed over the slot, so a reader never sees a
//! half-written report. Reads claim the file by renaming it away first, so a
//! report is handed out at most once.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::{CRASH_FILE_NAME, CrashConfig};
use crate::error::{Result, StoreError};
use crate::record::CrashRecord;

/// The crash report slot.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
    path: PathBuf,
}

impl ReportStore {
    /// Open the slot described by `config`. Performs no I/O.
    pub fn new(config: &CrashConfig) -> Self {
        Self {
            dir: config.data_dir().to_path_buf(),
            path: config.report_path(),
        }
    }

    /// Path of the report file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record`, replacing any previous report.
    ///
    /// Never fails: errors are logged and dropped because this runs while the
    /// process is already crashing.
    pub fn save(&self, record: &CrashRecord) {
        if let Err(e) = self.try_save(record) {
            tracing::warn!(error = %e, "failed to save crash report");
        }
    }

    /// Persist `record`, replacing any previous report.
    pub fn try_save(&self, record: &CrashRecord) -> Result<()> {
        let json = serde_json::to_vec(record).map_err(StoreError::Serialize)?;

        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let tmp = self.scratch_path("tmp");
        if let Err(e) = write_synced(&tmp, &json) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&self.path, e));
        }
        Ok(())
    }

    /// Remove and return the pending report, if there is a valid one.
    ///
    /// Missing, unreadable and corrupt reports all come back as `None`.
    pub fn take(&self) -> Option<CrashRecord> {
        match self.try_take() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable crash report");
                None
            }
        }
    }

    /// Remove and return the pending report.
    ///
    /// A corrupt report is deleted and reported as [`StoreError::Parse`].
    pub fn try_take(&self) -> Result<Option<CrashRecord>> {
        // Claiming by rename is atomic; a missing slot fails here with no side
        // effects.
        let claimed = self.scratch_path("taken");
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        }

        let read = fs::read(&claimed);
        if let Err(e) = fs::remove_file(&claimed) {
            tracing::warn!(path = %claimed.display(), error = %e, "failed to delete claimed crash report");
        }
        let bytes = read.map_err(|e| StoreError::io(&claimed, e))?;

        let record = serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "took pending crash report");
        Ok(Some(record))
    }

    /// Whether a report is waiting, without consuming it.
    pub fn has_pending(&self) -> bool {
        self.path.is_file()
    }

    fn scratch_path(&self, kind: &str) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.{}", CRASH_FILE_NAME, Uuid::new_v4(), kind))
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(data).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
