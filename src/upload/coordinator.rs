//! Upload pool
//!
//! A fixed set of worker tasks drains a bounded queue. When the queue is
//! full the submitting task runs the upload itself, which slows the writer
//! down instead of dropping work or growing memory. A pool with no workers
//! runs every upload on the caller.

use super::{UploadError, UploadOptions, Uploader};
use crate::buffer::ClosedFile;
use crate::metrics;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Called with the file after a successful upload
pub type OnComplete = Arc<dyn Fn(ClosedFile) -> io::Result<()> + Send + Sync>;

/// Completion hook that removes the local file
pub fn delete_on_complete() -> OnComplete {
    Arc::new(|file: ClosedFile| file.delete())
}

pub struct UploadTask {
    pub file: ClosedFile,
    pub options: UploadOptions,
    pub on_complete: Option<OnComplete>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
}

impl PoolConfig {
    pub fn new(workers: usize, queue_size: usize) -> Self {
        Self {
            workers,
            queue_size,
        }
    }

    /// Every upload runs on the submitting task
    pub fn synchronous() -> Self {
        Self::new(0, 0)
    }
}

/// How a submitted upload was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// Ran to completion on the caller, successfully or not
    Inline,
}

pub struct UploadCoordinator {
    name: &'static str,
    uploader: Arc<Uploader>,
    sender: Mutex<Option<mpsc::Sender<UploadTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    synchronous: bool,
    stopped: AtomicBool,
}

impl UploadCoordinator {
    /// Start the pool. Must be called inside a tokio runtime when
    /// `pool.workers > 0`.
    pub fn new(name: &'static str, uploader: Arc<Uploader>, pool: PoolConfig) -> Self {
        if pool.workers == 0 {
            return Self {
                name,
                uploader,
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                synchronous: true,
                stopped: AtomicBool::new(false),
            };
        }

        let (sender, receiver) = mpsc::channel::<UploadTask>(pool.queue_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..pool.workers)
            .map(|id| {
                let receiver = receiver.clone();
                let uploader = uploader.clone();
                tokio::spawn(async move {
                    loop {
                        let task = receiver.lock().await.recv().await;
                        match task {
                            Some(task) => {
                                let _ = execute(name, &uploader, task).await;
                            }
                            None => break,
                        }
                    }
                    tracing::debug!(pool = name, worker = id, "Upload worker stopped");
                })
            })
            .collect();

        tracing::debug!(
            pool = name,
            workers = pool.workers,
            queue_size = pool.queue_size,
            "Upload pool started"
        );

        Self {
            name,
            uploader,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            synchronous: false,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    /// Upload one file on the calling task and run the completion hook
    pub async fn upload(
        &self,
        file: ClosedFile,
        options: UploadOptions,
        on_complete: Option<OnComplete>,
    ) -> Result<(), UploadError> {
        execute(
            self.name,
            &self.uploader,
            UploadTask {
                file,
                options,
                on_complete,
            },
        )
        .await
    }

    /// Hand a file to the pool.
    ///
    /// Only fails when the pool has been stopped; the file then stays on
    /// disk. Upload failures are logged and leave the file in place.
    pub async fn submit(
        &self,
        file: ClosedFile,
        options: UploadOptions,
        on_complete: Option<OnComplete>,
    ) -> Result<Submission, UploadError> {
        let task = UploadTask {
            file,
            options,
            on_complete,
        };

        if self.is_stopped() {
            return Err(UploadError::Stopped);
        }
        if self.synchronous {
            let _ = execute(self.name, &self.uploader, task).await;
            return Ok(Submission::Inline);
        }

        let sender = self.sender.lock().clone().ok_or(UploadError::Stopped)?;
        match sender.try_send(task) {
            Ok(()) => Ok(Submission::Queued),
            Err(TrySendError::Full(task)) => {
                metrics::record_caller_runs(self.name);
                tracing::debug!(
                    pool = self.name,
                    key = %task.file.key(),
                    "Upload queue full, running upload on caller"
                );
                let _ = execute(self.name, &self.uploader, task).await;
                Ok(Submission::Inline)
            }
            Err(TrySendError::Closed(task)) => {
                tracing::warn!(
                    pool = self.name,
                    key = %task.file.key(),
                    path = %task.file.path().display(),
                    "Upload pool stopped, file left on disk"
                );
                Err(UploadError::Stopped)
            }
        }
    }

    /// Stop accepting work and wait for queued uploads to finish
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(pool = self.name, error = %e, "Upload worker panicked");
            }
        }
        tracing::debug!(pool = self.name, "Upload pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

async fn execute(pool: &str, uploader: &Uploader, task: UploadTask) -> Result<(), UploadError> {
    let UploadTask {
        file,
        options,
        on_complete,
    } = task;
    let size = file.size();

    if let Err(e) = uploader.upload(&file, &options).await {
        metrics::record_upload_failure(pool);
        metrics::record_error("upload");
        tracing::error!(
            pool = pool,
            key = %file.key(),
            path = %file.path().display(),
            error = %e,
            "Upload failed, file left on disk"
        );
        return Err(e);
    }
    metrics::record_upload_success(pool, size);

    if let Some(on_complete) = on_complete {
        let path = file.path().to_path_buf();
        if let Err(e) = on_complete(file) {
            metrics::record_error("on_complete");
            tracing::error!(
                pool = pool,
                path = %path.display(),
                error = %e,
                "Completion hook failed after upload"
            );
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::StoreOp;
    use crate::store::{
        MemoryStore, ObjectHeaders, ObjectStore, Payload, StoreError, UploadedPart,
    };
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn closed_file(dir: &TempDir, name: &str) -> ClosedFile {
        let path = dir.path().join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        ClosedFile::from_existing(&path, dir.path()).unwrap()
    }

    /// Holds every PUT until a permit is released
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
        entered: AtomicUsize,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                gate: Semaphore::new(0),
                entered: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn put_object(
            &self,
            key: &str,
            headers: &ObjectHeaders,
            payload: Payload,
        ) -> Result<Option<String>, StoreError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.inner.put_object(key, headers, payload).await
        }

        async fn initiate_multipart_upload(
            &self,
            key: &str,
            headers: &ObjectHeaders,
        ) -> Result<String, StoreError> {
            self.inner.initiate_multipart_upload(key, headers).await
        }

        async fn upload_part(
            &self,
            key: &str,
            headers: &ObjectHeaders,
            upload_id: &str,
            part_number: u32,
            payload: Payload,
        ) -> Result<UploadedPart, StoreError> {
            self.inner
                .upload_part(key, headers, upload_id, part_number, payload)
                .await
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[UploadedPart],
        ) -> Result<(), StoreError> {
            self.inner
                .complete_multipart_upload(key, upload_id, parts)
                .await
        }

        async fn list_multipart_parts(
            &self,
            key: &str,
            upload_id: &str,
        ) -> Result<Vec<UploadedPart>, StoreError> {
            self.inner.list_multipart_parts(key, upload_id).await
        }
    }

    async fn wait_for(counter: &AtomicUsize, value: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} uploads to start", value);
    }

    #[tokio::test]
    async fn test_uploads_and_deletes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = UploadCoordinator::new("test", uploader, PoolConfig::new(2, 4));

        for name in ["a.log", "b.log", "c.log"] {
            let file = closed_file(&dir, name);
            pool.submit(file, UploadOptions::default(), Some(delete_on_complete()))
                .await
                .unwrap();
        }
        pool.stop().await;

        assert_eq!(store.keys(), vec!["a.log", "b.log", "c.log"]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_runs_on_caller() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GatedStore::new());
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = Arc::new(UploadCoordinator::new(
            "caller-runs-test",
            uploader,
            PoolConfig::new(1, 1),
        ));

        // The only worker takes the first file and blocks on the gate.
        let first = pool
            .submit(closed_file(&dir, "1.log"), UploadOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(first, Submission::Queued);
        wait_for(&store.entered, 1).await;

        // The second file fills the queue.
        let second = pool
            .submit(closed_file(&dir, "2.log"), UploadOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(second, Submission::Queued);

        // The third one has nowhere to go and runs on the submitting task.
        let third_file = closed_file(&dir, "3.log");
        let submitter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.submit(third_file, UploadOptions::default(), None)
                    .await
            })
        };
        wait_for(&store.entered, 2).await;

        store.gate.add_permits(3);
        assert_eq!(submitter.await.unwrap().unwrap(), Submission::Inline);
        pool.stop().await;

        assert_eq!(store.inner.keys(), vec!["1.log", "2.log", "3.log"]);
        assert!(
            metrics::CALLER_RUNS_TOTAL
                .with_label_values(&["caller-runs-test"])
                .get()
                >= 1.0
        );
    }

    #[tokio::test]
    async fn test_synchronous_pool_runs_inline() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = UploadCoordinator::new("sync", uploader, PoolConfig::synchronous());

        let outcome = pool
            .submit(closed_file(&dir, "x.log"), UploadOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome, Submission::Inline);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreOp::Put, StoreError::Transport("reset".into()));
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = UploadCoordinator::new("isolated", uploader, PoolConfig::synchronous());

        pool.submit(
            closed_file(&dir, "fails.log"),
            UploadOptions::default(),
            Some(delete_on_complete()),
        )
        .await
        .unwrap();
        pool.submit(
            closed_file(&dir, "works.log"),
            UploadOptions::default(),
            Some(delete_on_complete()),
        )
        .await
        .unwrap();

        assert!(dir.path().join("fails.log").exists());
        assert!(!dir.path().join("works.log").exists());
        assert_eq!(store.keys(), vec!["works.log"]);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Arc::new(Uploader::new(store.clone(), 1024));
        let pool = UploadCoordinator::new("stopped", uploader, PoolConfig::new(1, 1));

        pool.stop().await;
        assert!(pool.is_stopped());

        let result = pool
            .submit(closed_file(&dir, "late.log"), UploadOptions::default(), None)
            .await;
        assert!(matches!(result, Err(UploadError::Stopped)));
        assert!(dir.path().join("late.log").exists());
    }
}
