//! Disk spill log backing the buffered channel variants.
//!
//! Records are framed with the shared length-prefix codec and appended to an
//! anonymous temporary file in the engine scratch directory. A small staging
//! buffer batches appends so that each record does not cost a syscall.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::BytesMut;

use crate::errors::ChannelError;
use crate::record::{self, Record};

/// Append-only record log with a single read cursor.
///
/// Writes go to an in-memory staging buffer and are flushed to the file when
/// the buffer exceeds its cap or when a read catches up with the staging area.
#[derive(Debug)]
pub(crate) struct SpillLog {
    file: File,
    staging: BytesMut,
    staging_cap: usize,
    /// Byte offset where the next flush appends.
    file_end: u64,
    /// Byte offset of the next unread frame in the file.
    read_off: u64,
    /// Records appended but not yet read.
    pending: u64,
    /// Records appended over the log's lifetime.
    total_appended: u64,
}

impl SpillLog {
    /// Create a log backed by an unlinked temporary file under `scratch`.
    pub(crate) fn create(scratch: &Path, staging_cap: usize) -> Result<Self, ChannelError> {
        let file = tempfile::tempfile_in(scratch).map_err(|err| {
            ChannelError::AllocationFailed(format!(
                "scratch file in {}: {err}",
                scratch.display()
            ))
        })?;
        Ok(Self {
            file,
            staging: BytesMut::with_capacity(staging_cap),
            staging_cap,
            file_end: 0,
            read_off: 0,
            pending: 0,
            total_appended: 0,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Append one record, flushing staging to disk when it grows past its cap.
    pub(crate) fn append(&mut self, rec: &Record) -> Result<(), ChannelError> {
        record::encode_record(&mut self.staging, rec);
        self.pending += 1;
        self.total_appended += 1;
        if self.staging.len() >= self.staging_cap {
            self.flush_staging()?;
        }
        Ok(())
    }

    /// Read the next record in append order, or `None` when drained.
    pub(crate) fn read_next(&mut self) -> Result<Option<Record>, ChannelError> {
        if self.pending == 0 {
            return Ok(None);
        }
        if self.read_off == self.file_end {
            // Backlog lives entirely in staging.
            self.flush_staging()?;
        }
        self.file.seek(SeekFrom::Start(self.read_off))?;
        let mut len_buf = [0u8; record::LENGTH_PREFIX];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        self.read_off += (record::LENGTH_PREFIX + len) as u64;
        self.pending -= 1;
        if self.pending == 0 {
            self.reset()?;
        }
        Ok(Some(Record::from(payload)))
    }

    /// Rewind the read cursor to the first record ever appended. Used by the
    /// cross-phase tape, which writes the whole stream before reading it.
    pub(crate) fn rewind(&mut self) -> Result<(), ChannelError> {
        self.flush_staging()?;
        self.read_off = 0;
        self.pending = self.total_appended;
        Ok(())
    }

    fn flush_staging(&mut self) -> Result<(), ChannelError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.file_end))?;
        self.file.write_all(&self.staging)?;
        self.file_end += self.staging.len() as u64;
        self.staging.clear();
        Ok(())
    }

    /// Truncate the file once fully drained so a long run does not keep dead
    /// bytes on disk.
    fn reset(&mut self) -> Result<(), ChannelError> {
        debug_assert!(self.staging.is_empty() || self.pending == 0);
        self.staging.clear();
        self.file.set_len(0)?;
        self.file_end = 0;
        self.read_off = 0;
        Ok(())
    }

    /// Decode a staged-only frame without touching the file. Test hook.
    #[cfg(test)]
    fn staged_frame(&mut self) -> record::Frame {
        record::decode_record(&mut self.staging)
    }
}
