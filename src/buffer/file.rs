//! Buffer files
//!
//! A [`BufferFile`] is the append-only file a partition is currently writing
//! into. Closing it yields a [`ClosedFile`], the read-only handle that the
//! upload pool owns from then on.

use crate::rotation::FileStat;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Byte sink behind a buffer file
pub trait BufferSink: Send {
    /// Append the whole buffer
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Bytes on disk, after flushing anything held in memory.
    ///
    /// Zero until the first byte has been accepted.
    fn size(&mut self) -> io::Result<u64>;

    /// Payload bytes accepted so far, before any encoding
    fn written(&self) -> u64;

    fn fsync(&mut self) -> io::Result<()>;

    /// Flush, finish any trailing framing and sync to disk
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Uncompressed sink
pub struct PlainSink {
    file: File,
    written: u64,
}

impl PlainSink {
    pub fn new(file: File) -> io::Result<Self> {
        let written = file.metadata()?.len();
        Ok(Self { file, written })
    }
}

impl BufferSink for PlainSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.written)
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Streaming gzip sink
pub struct GzipSink {
    encoder: GzEncoder<File>,
    written: u64,
}

impl GzipSink {
    pub fn new(file: File) -> Self {
        Self {
            encoder: GzEncoder::new(file, Compression::default()),
            written: 0,
        }
    }
}

impl BufferSink for GzipSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.encoder.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        // Flushing an untouched encoder would emit the gzip header.
        if self.written == 0 {
            return Ok(0);
        }
        self.encoder.flush()?;
        Ok(self.encoder.get_ref().metadata()?.len())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.encoder.flush()?;
        self.encoder.get_ref().sync_all()
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let file = self.encoder.finish()?;
        file.sync_all()
    }
}

/// The file a partition is currently appending to
pub struct BufferFile {
    key: String,
    partition: String,
    path: PathBuf,
    root: PathBuf,
    created_at: SystemTime,
    sink: Option<Box<dyn BufferSink>>,
}

impl BufferFile {
    pub(crate) fn new(
        key: String,
        partition: String,
        path: PathBuf,
        root: PathBuf,
        sink: Box<dyn BufferSink>,
    ) -> Self {
        Self {
            key,
            partition,
            path,
            root,
            created_at: SystemTime::now(),
            sink: Some(sink),
        }
    }

    /// Remote object key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Partition key this file belongs to, without a leading separator
    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.write(buf),
            None => Err(closed_error(&self.path)),
        }
    }

    pub fn size(&mut self) -> io::Result<u64> {
        match self.sink.as_mut() {
            Some(sink) => sink.size(),
            None => Ok(fs::metadata(&self.path)?.len()),
        }
    }

    /// No payload has been written, whatever the encoding put on disk
    pub fn is_empty(&mut self) -> io::Result<bool> {
        match self.sink.as_ref() {
            Some(sink) => Ok(sink.written() == 0),
            None => Ok(self.size()? == 0),
        }
    }

    pub fn fsync(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.fsync(),
            None => Ok(()),
        }
    }

    /// Snapshot used by the rotation policy
    pub fn stat(&mut self) -> io::Result<FileStat> {
        Ok(FileStat {
            size: self.size()?,
            created_at: self.created_at,
        })
    }

    /// Close the file and hand out the upload handle.
    ///
    /// Every later write fails.
    pub fn close(&mut self) -> io::Result<ClosedFile> {
        if let Some(sink) = self.sink.take() {
            sink.close()?;
        }
        ClosedFile::open(self.key.clone(), self.path.clone(), self.root.clone())
    }
}

fn closed_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("buffer file {} is closed", path.display()),
    )
}

/// A buffer file that will not be written again
#[derive(Debug)]
pub struct ClosedFile {
    key: String,
    path: PathBuf,
    root: PathBuf,
    size: u64,
}

impl ClosedFile {
    fn open(key: String, path: PathBuf, root: PathBuf) -> io::Result<Self> {
        let size = fs::metadata(&path)?.len();
        Ok(Self {
            key,
            path,
            root,
            size,
        })
    }

    /// Adopt a file left in the buffer tree by an earlier process.
    ///
    /// The key is the path relative to `root`, joined with `/`. A leading
    /// instance directory (the UUID the factory nests files under) is dropped
    /// so the key matches what the live pipeline would have used.
    pub fn from_existing(path: &Path, root: &Path) -> io::Result<Self> {
        let relative = path.strip_prefix(root).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not under {}", path.display(), root.display()),
            )
        })?;

        let mut parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.len() > 1 && uuid::Uuid::parse_str(&parts[0]).is_ok() {
            parts.remove(0);
        }

        Self::open(parts.join("/"), path.to_path_buf(), root.to_path_buf())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes at the time the file was closed
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remove the file and any directories it leaves empty below the root
    pub fn delete(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut dir = self.path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}
