//! Per-partition file factory

use super::file::{BufferFile, BufferSink, GzipSink, PlainSink};
use crate::config::Encoding;
use std::fs::{self, OpenOptions};
use std::io;
use std::mem;
use std::path::{Component, Path, PathBuf};

const NAME_PREFIX: &str = "spool";
const TXT_EXTENSION: &str = "log";
const GZIP_EXTENSION: &str = "log.gz";
const STRFTIME: &str = "%Y-%m-%dT%H.%M";

/// Owns the current buffer file of one partition.
///
/// Files live at `root/<instance uuid>/<partition path>/<generated name>`.
/// The generated name carries a second UUID, the creation minute, the tags
/// and the rotation counter.
pub struct TemporaryFileFactory {
    partition: String,
    tags: Vec<String>,
    encoding: Encoding,
    root: PathBuf,
    counter: u64,
    current: BufferFile,
}

impl TemporaryFileFactory {
    /// Create the factory and its first file
    pub fn new(partition: &str, tags: &[String], encoding: Encoding, root: &Path) -> io::Result<Self> {
        let partition = partition.trim_start_matches('/').to_string();
        let current = create_file(root, &partition, tags, encoding, 0)?;

        Ok(Self {
            partition,
            tags: tags.to_vec(),
            encoding,
            root: root.to_path_buf(),
            counter: 1,
            current,
        })
    }

    pub fn current(&self) -> &BufferFile {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut BufferFile {
        &mut self.current
    }

    /// Number of files this factory has created
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Install a fresh current file and return the previous one, still open.
    ///
    /// If the new file cannot be created the current file stays in place.
    pub fn rotate(&mut self) -> io::Result<BufferFile> {
        let fresh = create_file(
            &self.root,
            &self.partition,
            &self.tags,
            self.encoding,
            self.counter,
        )?;
        self.counter += 1;
        Ok(mem::replace(&mut self.current, fresh))
    }
}

fn extension(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::None => TXT_EXTENSION,
        Encoding::Gzip => GZIP_EXTENSION,
    }
}

fn generate_name(tags: &[String], encoding: Encoding, counter: u64) -> String {
    let filename = format!(
        "{}.{}.{}",
        NAME_PREFIX,
        uuid::Uuid::new_v4(),
        chrono::Local::now().format(STRFTIME)
    );

    if tags.is_empty() {
        format!("{}.part{}.{}", filename, counter, extension(encoding))
    } else {
        format!(
            "{}.tag_{}.part{}.{}",
            filename,
            tags.join("."),
            counter,
            extension(encoding)
        )
    }
}

/// Split a partition key into path segments, refusing anything that would
/// escape the buffer root.
fn partition_segments(partition: &str) -> io::Result<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in partition.split('/') {
        match Path::new(segment).components().next() {
            None | Some(Component::CurDir) => continue,
            Some(Component::Normal(_)) if !segment.contains('\\') => segments.push(segment),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid partition key '{}'", partition),
                ))
            }
        }
    }
    Ok(segments)
}

fn create_file(
    root: &Path,
    partition: &str,
    tags: &[String],
    encoding: Encoding,
    counter: u64,
) -> io::Result<BufferFile> {
    let segments = partition_segments(partition)?;
    let name = generate_name(tags, encoding, counter);

    let mut dir = root.join(uuid::Uuid::new_v4().to_string());
    dir.extend(&segments);
    fs::create_dir_all(&dir)?;

    let path = dir.join(&name);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let sink: Box<dyn BufferSink> = match encoding {
        Encoding::None => Box::new(PlainSink::new(file)?),
        Encoding::Gzip => Box::new(GzipSink::new(file)),
    };

    let mut key_parts = segments;
    key_parts.push(&name);
    let key = key_parts.join("/");

    tracing::debug!(key = %key, path = %path.display(), "Created buffer file");

    Ok(BufferFile::new(
        key,
        partition.to_string(),
        path,
        root.to_path_buf(),
        sink,
    ))
}
