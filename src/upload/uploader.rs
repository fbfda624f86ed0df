//! Single file upload
//!
//! Files up to the multipart threshold go up in one PUT carrying the MD5 of
//! the whole body. Larger files go through [`MultipartUploader`].

use super::{MultipartUploader, UploadError, UploadOptions};
use crate::buffer::ClosedFile;
use crate::metrics;
use crate::store::{ObjectStore, Payload};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    multipart_threshold: u64,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, multipart_threshold: u64) -> Self {
        Self {
            store,
            multipart_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold
    }

    /// Upload `file` under its key
    #[tracing::instrument(
        name = "upload.file",
        skip(self, file, options),
        fields(
            key = %file.key(),
            upload.bytes = file.size(),
            upload.method = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload(&self, file: &ClosedFile, options: &UploadOptions) -> Result<(), UploadError> {
        let start_time = Instant::now();
        let multipart = file.size() > self.multipart_threshold;
        let method = if multipart { "multipart" } else { "put_object" };
        tracing::Span::current().record("upload.method", method);

        let result = if multipart {
            let mut uploader = MultipartUploader::new(self.store.as_ref(), file, options.headers());
            let result = uploader.upload().await;
            if result.is_err() {
                metrics::record_multipart_upload_failure();
            }
            result
        } else {
            self.put_object(file, options).await
        };

        let duration = start_time.elapsed();
        metrics::record_upload_duration(method, duration.as_secs_f64());

        if result.is_ok() {
            tracing::info!(
                key = %file.key(),
                bytes = file.size(),
                method = method,
                duration_ms = duration.as_millis(),
                "Upload completed"
            );
        }
        result
    }

    async fn put_object(&self, file: &ClosedFile, options: &UploadOptions) -> Result<(), UploadError> {
        let body = tokio::fs::read(file.path()).await?;
        let payload = Payload::new(Bytes::from(body));

        let etag = self
            .store
            .put_object(file.key(), &options.headers(), payload)
            .await?;

        tracing::debug!(key = %file.key(), etag = ?etag, "PutObject completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::StoreOp;
    use crate::store::{MemoryStore, StoreError};
    use std::fs;
    use tempfile::TempDir;

    fn closed_file(dir: &TempDir, name: &str, data: &[u8]) -> ClosedFile {
        let path = dir.path().join(name);
        fs::write(&path, data).unwrap();
        ClosedFile::from_existing(&path, dir.path()).unwrap()
    }

    #[tokio::test]
    async fn test_small_file_is_put() {
        let dir = TempDir::new().unwrap();
        let file = closed_file(&dir, "small.log", b"hello world\n");
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), 1024);

        uploader
            .upload(&file, &UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(store.put_count(), 1);
        let object = store.object("small.log").unwrap();
        assert_eq!(object.body, "hello world\n");
        assert_eq!(object.parts, None);
    }

    #[tokio::test]
    async fn test_file_at_threshold_is_put() {
        let dir = TempDir::new().unwrap();
        let file = closed_file(&dir, "edge.log", &[b'x'; 64]);
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), 64);

        uploader
            .upload(&file, &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(store.put_count(), 1);
        assert!(store.completed_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_large_file_goes_multipart() {
        let dir = TempDir::new().unwrap();
        let file = closed_file(&dir, "large.log", &[b'y'; 65]);
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), 64);

        uploader
            .upload(&file, &UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(store.put_count(), 0);
        assert_eq!(store.completed_uploads().len(), 1);
        assert_eq!(store.object("large.log").unwrap().body.len(), 65);
    }

    #[tokio::test]
    async fn test_headers_reach_the_store() {
        let dir = TempDir::new().unwrap();
        let file = closed_file(&dir, "enc.log.gz", b"zz");
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(store.clone(), 1024);
        let options = UploadOptions {
            content_encoding: Some("gzip".into()),
            server_side_encryption: None,
        };

        uploader.upload(&file, &options).await.unwrap();
        let object = store.object("enc.log.gz").unwrap();
        assert_eq!(object.headers.content_encoding.as_deref(), Some("gzip"));
    }

    #[tokio::test]
    async fn test_put_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let file = closed_file(&dir, "f.log", b"x");
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreOp::Put, StoreError::Transport("timeout".into()));
        let uploader = Uploader::new(store.clone(), 1024);

        let err = uploader
            .upload(&file, &UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
        assert!(store.keys().is_empty());
    }
}
