//! Superblock error log.
//!
//! Errors classified as real filesystem errors are recorded in the
//! superblock's first/last error fields and flushed to disk before the
//! error is handed back. Benign conditions (missing names, full volumes,
//! unsupported operations) pass through untouched.

use crate::fs::{Ext2Fs, now_secs};
use e2_error::{E2Error, Result};
use e2_ondisk::superblock::ErrorRecord;
use e2_types::InodeNumber;
use std::panic::Location;
use std::path::Path;
use tracing::{error, warn};

impl Ext2Fs {
    /// Record `err` against `ino` if it is a logged error, then return it.
    ///
    /// The caller's source location fills the record's function and line
    /// fields. A failure to flush the record is logged and dropped; the
    /// returned error is always `err`.
    #[track_caller]
    pub fn translate_error(&self, err: E2Error, ino: InodeNumber) -> E2Error {
        if err.is_logged() {
            self.record_error(&err, ino, Location::caller());
        }
        err
    }

    /// Pass `result` through [`Ext2Fs::translate_error`].
    #[track_caller]
    pub fn report<T>(&self, result: Result<T>, ino: InodeNumber) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.translate_error(err, ino)),
        }
    }

    fn record_error(&self, err: &E2Error, ino: InodeNumber, at: &Location<'_>) {
        let func = Path::new(at.file())
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(at.file());
        let mut record = ErrorRecord {
            time: now_secs(),
            ino: u32::try_from(ino.0).unwrap_or(u32::MAX),
            line: at.line(),
            block: err.code().unsigned_abs(),
            func: [0; 32],
        };
        record.set_func_name(func);

        let count = {
            let mut meta = self.meta.lock();
            meta.sb.last_error = record;
            if meta.sb.first_error.time == 0 {
                meta.sb.first_error = record;
            }
            meta.sb.error_count = meta.sb.error_count.saturating_add(1);
            meta.sb_dirty = true;
            meta.sb.error_count
        };
        error!(
            target: "e2fs::errlog",
            event = "fs_error",
            ino = ino.0,
            code = err.code(),
            errno = err.to_errno(),
            func,
            line = at.line(),
            count,
            error = %err
        );

        if self.is_read_only() {
            return;
        }
        if let Err(flush_err) = self.flush() {
            warn!(
                target: "e2fs::errlog",
                event = "error_log_flush_failed",
                ino = ino.0,
                error = %flush_err
            );
        }
    }
}
