//! Spool pipeline
//!
//! Ties the pieces together: records are appended to the partition's
//! current buffer file, the rotation policy is consulted after every batch
//! and on a timer, and rotated files go to the live upload pool. Files left
//! over from an earlier run are uploaded by a separate recovery pool.

use crate::buffer::{ClosedFile, FileRepository};
use crate::config::{Config, ConfigError};
use crate::metrics;
use crate::recovery::CrashRecoveryScanner;
use crate::rotation::RotationPolicy;
use crate::store::ObjectStore;
use crate::upload::{
    delete_on_complete, PoolConfig, UploadCoordinator, UploadError, UploadOptions, Uploader,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;

/// How often idle partitions are checked for age-based rotation
pub const PERIODIC_CHECK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Spooler is closed")]
    Closed,
}

struct SpoolCore {
    repository: FileRepository,
    policy: RotationPolicy,
    coordinator: UploadCoordinator,
    options: UploadOptions,
    tmpdir: PathBuf,
}

impl SpoolCore {
    /// Rotate each key the policy selects and submit the closed file right
    /// away. A failing key does not stop the others; the first error is
    /// returned once every key has been visited.
    async fn rotate_if_needed(
        self: &Arc<Self>,
        keys: &[String],
        trigger: &str,
    ) -> Result<usize, SpoolError> {
        let mut rotated = 0;
        let mut first_error = None;

        for key in keys {
            let key = key.clone();
            let outcome = self
                .blocking(move |core| {
                    core.repository.get_factory(&key, |factory| {
                        let stat = factory.current_mut().stat()?;
                        if !core.policy.should_rotate(&stat) {
                            return Ok(None);
                        }

                        tracing::debug!(
                            key = %factory.current().key(),
                            path = %factory.current().path().display(),
                            strategy = core.policy.name(),
                            size = stat.size,
                            "Rotating buffer file"
                        );
                        let mut previous = factory.rotate()?;
                        previous.close().map(Some)
                    })
                })
                .await;

            match outcome {
                Ok(Some(file)) => {
                    metrics::record_rotation(trigger);
                    rotated += 1;
                    if let Err(e) = self.submit(file).await {
                        first_error.get_or_insert(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::record_error("rotation");
                    tracing::error!(error = %e, "Failed to rotate buffer file");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(rotated),
        }
    }

    async fn submit(&self, file: ClosedFile) -> Result<(), SpoolError> {
        tracing::debug!(key = %file.key(), "Adding file to upload queue");
        self.coordinator
            .submit(file, self.options.clone(), Some(delete_on_complete()))
            .await?;
        Ok(())
    }

    /// Run buffer file I/O on the blocking pool
    async fn blocking<F, R>(self: &Arc<Self>, f: F) -> Result<R, SpoolError>
    where
        F: FnOnce(&SpoolCore) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let core = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(core.as_ref()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .map_err(SpoolError::from)
    }
}

struct PeriodicCheck {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// The buffering and upload pipeline
pub struct Spooler {
    core: Arc<SpoolCore>,
    periodic: Mutex<Option<PeriodicCheck>>,
    recovery: Mutex<Option<(JoinHandle<()>, Arc<UploadCoordinator>)>>,
    /// Writers hold it shared; `close` takes it exclusively to flip `closed`
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl Spooler {
    /// Start the pipeline with the default periodic check interval
    pub async fn start(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self, SpoolError> {
        Self::start_with_interval(config, store, PERIODIC_CHECK_INTERVAL).await
    }

    pub async fn start_with_interval(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        interval: Duration,
    ) -> Result<Self, SpoolError> {
        let policy = RotationPolicy::from_config(&config.rotation)?;
        let tmpdir = config.buffer.tmpdir.clone();
        fs::create_dir_all(&tmpdir)?;

        let options = UploadOptions::from_config(&config.buffer, &config.upload);
        let uploader = Arc::new(Uploader::new(store, config.upload.multipart_threshold));

        // Taken before the live repository creates anything under tmpdir.
        let recovery = if config.recovery.restore {
            let orphans = CrashRecoveryScanner::scan(&tmpdir)?;
            let pool = Arc::new(UploadCoordinator::new(
                "recovery",
                uploader.clone(),
                PoolConfig::new(config.recovery.workers, config.recovery.queue_size),
            ));
            let scanner = CrashRecoveryScanner::new(&tmpdir, pool.clone(), options.clone());
            let handle = tokio::spawn(async move {
                match scanner.recover(orphans).await {
                    Ok(count) => tracing::debug!(files = count, "Crash recovery finished"),
                    Err(e) => tracing::error!(error = %e, "Crash recovery failed"),
                }
            });
            Some((handle, pool))
        } else {
            None
        };

        let coordinator = UploadCoordinator::new(
            "live",
            uploader,
            PoolConfig::new(config.upload.workers, config.upload.queue_size),
        );
        let repository = FileRepository::new(
            config.buffer.tags.clone(),
            config.buffer.encoding,
            &tmpdir,
        );

        let core = Arc::new(SpoolCore {
            repository,
            policy,
            coordinator,
            options,
            tmpdir,
        });

        let periodic = if core.policy.needs_periodic() {
            Some(start_periodic_check(core.clone(), interval))
        } else {
            None
        };

        tracing::info!(
            tmpdir = %core.tmpdir.display(),
            rotation = %core.policy,
            restore = config.recovery.restore,
            "Spooler started"
        );

        Ok(Self {
            core,
            periodic: Mutex::new(periodic),
            recovery: Mutex::new(recovery),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn repository(&self) -> &FileRepository {
        &self.core.repository
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.core.policy
    }

    pub fn tmpdir(&self) -> &Path {
        &self.core.tmpdir
    }

    /// Append each record to its partition, then rotate what needs it
    pub async fn write_batch<I, K, V>(&self, records: I) -> Result<(), SpoolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        let records: Vec<(String, Vec<u8>)> = records
            .into_iter()
            .map(|(key, data)| (key.as_ref().to_string(), data.as_ref().to_vec()))
            .collect();

        let _gate = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SpoolError::Closed);
        }

        let keys = self
            .core
            .blocking(move |core| {
                let mut touched = BTreeSet::new();
                for (key, data) in records {
                    if let Err(e) = core.repository.get_file(&key, |file| file.write(&data)) {
                        metrics::record_error("buffer_write");
                        tracing::error!(
                            key = %key,
                            tmpdir = %core.tmpdir.display(),
                            error = %e,
                            "Failed to write to buffer file"
                        );
                        return Err(e);
                    }
                    metrics::record_buffered(data.len() as u64);
                    touched.insert(key);
                }
                metrics::set_open_buffer_files(core.repository.len());
                Ok(touched.into_iter().collect::<Vec<_>>())
            })
            .await?;

        self.core.rotate_if_needed(&keys, "write").await?;
        Ok(())
    }

    /// Rotate and submit the current file of each key the policy selects.
    ///
    /// Returns how many files were rotated.
    pub async fn rotate_if_needed(&self, keys: &[String]) -> Result<usize, SpoolError> {
        let _gate = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SpoolError::Closed);
        }
        self.core.rotate_if_needed(keys, "write").await
    }

    /// Flush everything and wait for the uploads.
    ///
    /// Non-empty current files are uploaded, empty ones are removed.
    pub async fn close(&self) -> Result<(), SpoolError> {
        {
            // Waits for writers already past the closed check.
            let _gate = self.gate.write().await;
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        let periodic = self.periodic.lock().take();
        if let Some(periodic) = periodic {
            let _ = periodic.shutdown.send(());
            if let Err(e) = periodic.handle.await {
                tracing::error!(error = %e, "Periodic rotation check panicked");
            }
        }

        tracing::debug!(tmpdir = %self.core.tmpdir.display(), "Uploading current workspace");
        let pending = self
            .core
            .blocking(|core| {
                let mut pending = Vec::new();
                core.repository.each_file(|file| {
                    let empty = file.is_empty()?;
                    pending.push((file.close()?, empty));
                    Ok(())
                })?;
                Ok(pending)
            })
            .await?;

        for (file, empty) in pending {
            if empty {
                file.delete()?;
                continue;
            }
            metrics::record_rotation("close");
            if let Err(e) = self.core.submit(file).await {
                tracing::error!(error = %e, "Failed to submit buffer file at shutdown");
            }
        }

        self.core.repository.shutdown();
        metrics::set_open_buffer_files(0);
        self.core.coordinator.stop().await;

        let recovery = self.recovery.lock().take();
        if let Some((handle, pool)) = recovery {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Crash recovery task panicked");
            }
            pool.stop().await;
        }

        tracing::info!("Spooler closed");
        Ok(())
    }
}

fn start_periodic_check(core: Arc<SpoolCore>, interval: Duration) -> PeriodicCheck {
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            // Runs to completion so a rotated file is always submitted.
            let keys = core.repository.keys();
            tracing::debug!(keys = keys.len(), "Periodic rotation check");
            if let Err(e) = core.rotate_if_needed(&keys, "periodic").await {
                metrics::record_error("periodic_check");
                tracing::error!(error = %e, "Periodic rotation check failed");
            }
        }
    });

    PeriodicCheck { shutdown, handle }
}
