use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tracing::debug;

use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;
use crate::types::{RecordMessage, StreamStatus};

/// One line of a spill file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpooledEntry {
    Record(RecordMessage),
    /// Sentinel closing the stream, nothing is read past it.
    Status(StreamStatus),
}

/// Appends entries to a new spill file.
#[derive(Debug)]
pub(crate) struct SpillWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SpillWriter {
    /// Creates the spill file at `path`, failing if it already exists.
    pub(crate) async fn create(path: PathBuf) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                sync_error!(
                    ErrorKind::SpoolWriteFailed,
                    "Failed to create spool directory",
                    format!("Could not create {}: {err}", parent.display()),
                    source: err
                )
            })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| write_error(&path, err))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub(crate) async fn write(&mut self, entry: &SpooledEntry) -> SyncResult<()> {
        let mut line = serde_json::to_vec(entry).map_err(|err| {
            sync_error!(
                ErrorKind::SerializationError,
                "Failed to serialize spooled entry",
                format!("Could not serialize an entry of {}: {err}", self.path.display()),
                source: err
            )
        })?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .await
            .map_err(|err| write_error(&self.path, err))
    }

    /// Flushes buffered entries and syncs the file to disk.
    pub(crate) async fn finish(mut self) -> SyncResult<SpillFile> {
        self.writer
            .flush()
            .await
            .map_err(|err| write_error(&self.path, err))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|err| write_error(&self.path, err))?;

        Ok(SpillFile { path: self.path })
    }

    /// Drops the writer and removes the partially written file.
    pub(crate) async fn discard(self) -> SyncResult<()> {
        let Self { path, writer } = self;
        drop(writer);

        SpillFile { path }.delete().await
    }
}

fn write_error(path: &Path, err: std::io::Error) -> crate::error::SyncError {
    sync_error!(
        ErrorKind::SpoolWriteFailed,
        "Failed to write spill file",
        format!("Could not write {}: {err}", path.display()),
        source: err
    )
}

/// A completed spill file on local disk.
///
/// The file is only deleted through [`SpillFile::delete`], so a spill file that was never handed
/// off successfully stays on disk and can be replayed.
#[derive(Debug, PartialEq, Eq)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    /// Refers to an existing spill file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the file for reading from the start.
    pub async fn open(&self) -> SyncResult<SpooledRecords> {
        let file = File::open(&self.path).await.map_err(|err| {
            sync_error!(
                ErrorKind::SpoolReadFailed,
                "Failed to open spill file",
                format!("Could not open {}: {err}", self.path.display()),
                source: err
            )
        })?;

        Ok(SpooledRecords {
            path: self.path.clone(),
            lines: BufReader::new(file).lines(),
            end_of_stream: None,
            records_read: 0,
            finished: false,
        })
    }

    /// Deletes the file. Deleting a file that is already gone succeeds.
    pub async fn delete(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "deleted spill file");
                Ok(())
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(sync_error!(
                ErrorKind::IoError,
                "Failed to delete spill file",
                format!("Could not delete {}: {err}", self.path.display()),
                source: err
            )),
        }
    }
}

/// Pull-based reader over the records of a spill file, in the order they were spooled.
///
/// Records are read one at a time. Iteration ends at the end of the file or at a stream status
/// sentinel, which is exposed through [`SpooledRecords::end_of_stream`]. The reader is not
/// restartable, open the file again to read it twice.
#[derive(Debug)]
pub struct SpooledRecords {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    end_of_stream: Option<StreamStatus>,
    records_read: u64,
    finished: bool,
}

impl SpooledRecords {
    /// Returns the next record, or `None` once the records of the file are exhausted.
    pub async fn next(&mut self) -> SyncResult<Option<RecordMessage>> {
        while !self.finished {
            let line = self.lines.next_line().await.map_err(|err| {
                sync_error!(
                    ErrorKind::SpoolReadFailed,
                    "Failed to read spill file",
                    format!("Could not read {}: {err}", self.path.display()),
                    source: err
                )
            })?;

            let Some(line) = line else {
                self.finished = true;
                break;
            };

            if line.trim().is_empty() {
                continue;
            }

            let entry: SpooledEntry = serde_json::from_str(&line).map_err(|err| {
                sync_error!(
                    ErrorKind::SpoolReadFailed,
                    "Failed to parse spill file entry",
                    format!("Invalid entry in {}: {err}", self.path.display()),
                    source: err
                )
            })?;

            match entry {
                SpooledEntry::Record(record) => {
                    self.records_read += 1;
                    return Ok(Some(record));
                }
                SpooledEntry::Status(status) => {
                    self.end_of_stream = Some(status);
                    self.finished = true;
                }
            }
        }

        Ok(None)
    }

    /// Reads up to `max` records.
    pub async fn next_chunk(&mut self, max: usize) -> SyncResult<Vec<RecordMessage>> {
        let mut chunk = Vec::with_capacity(max.min(1024));
        while chunk.len() < max {
            match self.next().await? {
                Some(record) => chunk.push(record),
                None => break,
            }
        }

        Ok(chunk)
    }

    /// Returns the status sentinel, once it has been read.
    pub fn end_of_stream(&self) -> Option<StreamStatus> {
        self.end_of_stream
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::StreamDescriptor;

    fn record(id: i64) -> RecordMessage {
        RecordMessage::new(
            StreamDescriptor::new(Some("public"), "events"),
            serde_json::json!({ "ID": id }),
            Utc::now(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reading_stops_at_status_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::create(dir.path().join("spill.jsonl")).await.unwrap();
        writer.write(&SpooledEntry::Record(record(1))).await.unwrap();
        writer.write(&SpooledEntry::Record(record(2))).await.unwrap();
        writer
            .write(&SpooledEntry::Status(StreamStatus::Complete))
            .await
            .unwrap();
        writer.write(&SpooledEntry::Record(record(3))).await.unwrap();
        let spill = writer.finish().await.unwrap();

        let mut records = spill.open().await.unwrap();
        assert_eq!(records.next().await.unwrap().unwrap().data["ID"], 1);
        assert_eq!(records.end_of_stream(), None);
        assert_eq!(records.next_chunk(10).await.unwrap().len(), 1);
        assert_eq!(records.next().await.unwrap(), None);
        assert_eq!(records.end_of_stream(), Some(StreamStatus::Complete));
        assert_eq!(records.records_read(), 2);

        spill.delete().await.unwrap();
        assert!(!spill.path().exists());
        spill.delete().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn creating_an_existing_spill_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");
        let writer = SpillWriter::create(path.clone()).await.unwrap();
        writer.finish().await.unwrap();

        let err = SpillWriter::create(path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpoolWriteFailed);
    }
}
