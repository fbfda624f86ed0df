//! Partition key to factory mapping
//!
//! The map itself is a [`DashMap`], so creating the factory for a new key is
//! a single entry operation and two racing writers end up sharing one
//! factory. Each factory sits behind its own mutex: writers and the rotation
//! checker for one key are serialized, other keys are never blocked.

use super::factory::TemporaryFileFactory;
use super::file::BufferFile;
use crate::config::Encoding;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type SharedFactory = Arc<Mutex<TemporaryFileFactory>>;

pub struct FileRepository {
    tags: Vec<String>,
    encoding: Encoding,
    root: PathBuf,
    factories: DashMap<String, SharedFactory>,
}

impl FileRepository {
    pub fn new(tags: Vec<String>, encoding: Encoding, root: impl Into<PathBuf>) -> Self {
        Self {
            tags,
            encoding,
            root: root.into(),
            factories: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run `f` against the current file of `key`, creating the partition on
    /// first use. Errors from `f` are returned unchanged.
    pub fn get_file<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut BufferFile) -> io::Result<R>,
    ) -> io::Result<R> {
        let factory = self.factory(key)?;
        let mut guard = factory.lock();
        f(guard.current_mut())
    }

    /// Run `f` against the factory of `key` with the same per-key exclusion
    /// as [`get_file`](Self::get_file).
    pub fn get_factory<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut TemporaryFileFactory) -> io::Result<R>,
    ) -> io::Result<R> {
        let factory = self.factory(key)?;
        let mut guard = factory.lock();
        f(&mut guard)
    }

    /// Visit the current file of every known partition
    pub fn each_file(
        &self,
        mut f: impl FnMut(&mut BufferFile) -> io::Result<()>,
    ) -> io::Result<()> {
        for factory in self.snapshot() {
            let mut guard = factory.lock();
            f(guard.current_mut())?;
        }
        Ok(())
    }

    /// Known partition keys
    pub fn keys(&self) -> Vec<String> {
        self.factories.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Drop every factory. Call once writes and rotations have drained.
    pub fn shutdown(&self) {
        self.factories.clear();
    }

    fn snapshot(&self) -> Vec<SharedFactory> {
        self.factories
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn factory(&self, key: &str) -> io::Result<SharedFactory> {
        let key = key.trim_start_matches('/');

        if let Some(existing) = self.factories.get(key) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.factories.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let factory = TemporaryFileFactory::new(key, &self.tags, self.encoding, &self.root)?;
                let shared = Arc::new(Mutex::new(factory));
                entry.insert(Arc::clone(&shared));
                Ok(shared)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn repository(dir: &TempDir) -> FileRepository {
        FileRepository::new(
            vec!["tag1".into(), "tag2".into(), "tag3".into()],
            Encoding::None,
            dir.path(),
        )
    }

    #[test]
    fn test_get_file_creates_partition() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);

        let partition = repo
            .get_file("aprefix", |file| Ok(file.partition().to_string()))
            .unwrap();
        assert_eq!(partition, "aprefix");
        assert_eq!(repo.keys(), vec!["aprefix".to_string()]);
    }

    #[test]
    fn test_leading_separator_is_stripped() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);

        let partition = repo
            .get_file("/ss/overwatch", |file| Ok(file.partition().to_string()))
            .unwrap();
        assert_eq!(partition, "ss/overwatch");

        repo.get_file("ss/overwatch", |_| Ok(())).unwrap();
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_get_factory_exposes_rotation() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);

        let counter = repo
            .get_factory("aprefix", |factory| {
                factory.rotate()?;
                Ok(factory.counter())
            })
            .unwrap();
        assert_eq!(counter, 2);
    }

    #[test]
    fn test_write_error_propagates() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);

        let err = repo
            .get_file("k", |_| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::WriteZero, "no space"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_factory() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    repo.get_file("hot", |file| Ok(file.path().to_path_buf()))
                        .unwrap()
                })
            })
            .collect();

        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_same_key_writes_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));

        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let repo = Arc::clone(&repo);
                thread::spawn(move || {
                    let record = vec![b'a' + n; 1000];
                    for _ in 0..50 {
                        repo.get_file("shared", |file| file.write(&record)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let path = repo
            .get_file("shared", |file| {
                file.fsync()?;
                Ok(file.path().to_path_buf())
            })
            .unwrap();
        let content = std::fs::read(path).unwrap();
        assert_eq!(content.len(), 4 * 50 * 1000);
        for chunk in content.chunks(1000) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    #[test]
    fn test_other_keys_proceed_while_one_is_held() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(repository(&dir));
        repo.get_file("other", |_| Ok(())).unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                repo.get_file("busy", |_| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
            })
        };

        held_rx.recv().unwrap();
        // Would deadlock if the lock were global.
        repo.get_file("other", |file| file.write(b"free")).unwrap();
        repo.get_file("brand-new", |file| file.write(b"free")).unwrap();

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(repo.len(), 3);
    }

    #[test]
    fn test_each_file_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir);
        for key in ["a", "b", "c"] {
            repo.get_file(key, |file| file.write(key.as_bytes())).unwrap();
        }

        let mut closed = Vec::new();
        repo.each_file(|file| {
            closed.push(file.close()?);
            Ok(())
        })
        .unwrap();
        assert_eq!(closed.len(), 3);
        assert!(closed.iter().all(|f| f.size() == 1));

        repo.shutdown();
        assert!(repo.is_empty());
    }
}
