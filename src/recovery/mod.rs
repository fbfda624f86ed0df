//! Crash recovery
//!
//! Files still under the buffer root at startup were closed (or abandoned)
//! by an earlier process. Each one is adopted as a [`ClosedFile`] and sent
//! through its own upload pool, independent of the live one.

use crate::buffer::ClosedFile;
use crate::metrics;
use crate::upload::{delete_on_complete, UploadCoordinator, UploadError, UploadOptions};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub struct CrashRecoveryScanner {
    root: PathBuf,
    coordinator: Arc<UploadCoordinator>,
    options: UploadOptions,
}

impl CrashRecoveryScanner {
    pub fn new(root: impl Into<PathBuf>, coordinator: Arc<UploadCoordinator>, options: UploadOptions) -> Self {
        Self {
            root: root.into(),
            coordinator,
            options,
        }
    }

    /// Every regular file below `root`, sorted by name within each directory.
    ///
    /// A missing root yields nothing.
    pub fn scan(root: &Path) -> io::Result<Vec<ClosedFile>> {
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(ClosedFile::from_existing(entry.path(), root)?);
            }
        }
        Ok(files)
    }

    /// Upload `files` and delete each one that made it.
    ///
    /// Returns how many were handed to the pool. The pool is stopped once
    /// everything is submitted, so this waits for the uploads to finish.
    pub async fn recover(&self, files: Vec<ClosedFile>) -> Result<usize, UploadError> {
        let count = files.len();
        if count > 0 {
            metrics::record_recovered_files(count);
            tracing::info!(
                root = %self.root.display(),
                files = count,
                "Recovering buffer files from a previous run"
            );
        }

        let mut submitted = 0;
        for file in files {
            tracing::debug!(key = %file.key(), path = %file.path().display(), "Recovering file");
            match self
                .coordinator
                .submit(file, self.options.clone(), Some(delete_on_complete()))
                .await
            {
                Ok(_) => submitted += 1,
                Err(UploadError::Stopped) => break,
                Err(e) => return Err(e),
            }
        }

        self.coordinator.stop().await;
        Ok(submitted)
    }

    /// Scan the root and recover whatever is there
    pub async fn run(&self) -> Result<usize, UploadError> {
        let files = Self::scan(&self.root)?;
        self.recover(files).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::upload::{PoolConfig, Uploader};
    use tempfile::TempDir;

    #[test]
    fn test_scan_keys_by_relative_path() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty-file"), b"").unwrap();
        fs::write(dir.path().join("non-empty-file"), b"data").unwrap();

        let files = CrashRecoveryScanner::scan(dir.path()).unwrap();
        let keys: Vec<_> = files.iter().map(|f| f.key().to_string()).collect();
        assert_eq!(keys, vec!["empty-file", "non-empty-file"]);
    }

    #[test]
    fn test_scan_drops_instance_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir
            .path()
            .join("0b5a8f9e-8f6e-4b55-9d3c-3c1f0d2a7e11")
            .join("app")
            .join("web");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("spool.part1.log"), b"x").unwrap();

        let files = CrashRecoveryScanner::scan(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key(), "app/web/spool.part1.log");
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        let files = CrashRecoveryScanner::scan(&dir.path().join("nope")).unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_recover_uploads_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty-file"), b"").unwrap();
        fs::write(dir.path().join("non-empty-file"), b"data").unwrap();

        let store = Arc::new(MemoryStore::new());
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = Arc::new(UploadCoordinator::new(
            "recovery",
            uploader,
            PoolConfig::synchronous(),
        ));
        let scanner = CrashRecoveryScanner::new(dir.path(), pool, UploadOptions::default());

        assert_eq!(scanner.run().await.unwrap(), 2);
        assert_eq!(store.keys(), vec!["empty-file", "non-empty-file"]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
