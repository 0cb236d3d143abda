//! Saving backends.
//!
//! [`SavingBackend`] opens a [`FrameSink`] for one target file; the sink
//! encodes and appends frames until it is closed. [`FileBackend`] writes to
//! the local filesystem with `tokio::fs`.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::config::{OverwritePolicy, SavingFormat};
use super::edf;
use crate::data::frame::FrameRecord;
use crate::error::{AppResult, DaqError};

/// How a target file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail with `FileExists` if the file is present
    CreateNew,
    /// Create or truncate
    Truncate,
    /// Create or append
    Append,
}

impl From<OverwritePolicy> for OpenMode {
    fn from(policy: OverwritePolicy) -> Self {
        match policy {
            OverwritePolicy::Abort => OpenMode::CreateNew,
            OverwritePolicy::Overwrite => OpenMode::Truncate,
            OverwritePolicy::Append => OpenMode::Append,
        }
    }
}

/// An open target file.
#[async_trait]
pub trait FrameSink: Send {
    /// Encode and write one frame.
    async fn write(&mut self, record: &FrameRecord) -> AppResult<()>;

    /// Flush and sync. Consumes the sink so a file is finalized once.
    async fn close(self: Box<Self>) -> AppResult<()>;

    /// Frames written so far.
    fn frames_written(&self) -> usize;

    /// Target path.
    fn path(&self) -> &Path;
}

/// Opens sinks.
#[async_trait]
pub trait SavingBackend: Send + Sync {
    /// Open `path` according to `mode`.
    ///
    /// # Errors
    /// - `FileExists` under `CreateNew` when the file is present
    /// - `Io` for any other failure
    async fn open(&self, path: &Path, mode: OpenMode) -> AppResult<Box<dyn FrameSink>>;
}

/// Local filesystem backend for one format.
#[derive(Debug, Clone, Copy)]
pub struct FileBackend {
    format: SavingFormat,
}

impl FileBackend {
    /// Backend writing `format`.
    pub fn new(format: SavingFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl SavingBackend for FileBackend {
    async fn open(&self, path: &Path, mode: OpenMode) -> AppResult<Box<dyn FrameSink>> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::CreateNew => options.write(true).create_new(true),
            OpenMode::Truncate => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = options.open(path).await.map_err(|e| match e.kind() {
            IoErrorKind::AlreadyExists => DaqError::FileExists(path.to_path_buf()),
            _ => DaqError::Io(e),
        })?;
        debug!(path = %path.display(), ?mode, format = %self.format, "Opened saving target");

        Ok(Box::new(FileSink {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            format: self.format,
            frames: 0,
        }))
    }
}

struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    format: SavingFormat,
    frames: usize,
}

#[async_trait]
impl FrameSink for FileSink {
    async fn write(&mut self, record: &FrameRecord) -> AppResult<()> {
        let bytes = match self.format {
            SavingFormat::Edf => edf::encode(record, self.frames + 1)?,
            SavingFormat::Raw => record.frame.data.to_vec(),
            #[cfg(feature = "storage_tiff")]
            SavingFormat::Tiff => super::tiff::encode(record)?,
            #[cfg(not(feature = "storage_tiff"))]
            SavingFormat::Tiff => {
                return Err(DaqError::InvalidConfig(
                    "format 'tiff' is not available in this build".into(),
                ))
            }
        };
        self.writer.write_all(&bytes).await?;
        self.frames += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        let mut sink = self;
        sink.writer.flush().await?;
        sink.writer.get_mut().sync_all().await?;
        debug!(path = %sink.path.display(), frames = sink.frames, "Closed saving target");
        Ok(())
    }

    fn frames_written(&self) -> usize {
        self.frames
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
