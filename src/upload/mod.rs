//! Upload module
//!
//! Turns closed buffer files into remote objects. [`Uploader`] handles one
//! file (single PUT or multipart), [`UploadCoordinator`] runs uploads on a
//! bounded pool and calls the completion hook, which normally deletes the
//! local file.

use crate::config::{BufferConfig, UploadConfig};
use crate::store::{EncryptionHeaders, ObjectHeaders, StoreError};
use std::fmt;
use thiserror::Error;

pub mod coordinator;
pub mod multipart;
pub mod uploader;

pub use coordinator::{
    delete_on_complete, OnComplete, PoolConfig, Submission, UploadCoordinator, UploadTask,
};
pub use multipart::{calculate_segment, MultipartState, MultipartUploader};
pub use uploader::Uploader;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or auth failure talking to the store
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected answer from the store, or a multipart invariant broken
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upload pool is stopped")]
    Stopped,
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transport(msg) => UploadError::Transport(msg),
            StoreError::Protocol(msg) => UploadError::Protocol(msg),
        }
    }
}

/// Customer supplied server side encryption
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSideEncryption {
    pub algorithm: String,
    pub customer_key: Vec<u8>,
}

impl fmt::Debug for ServerSideEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSideEncryption")
            .field("algorithm", &self.algorithm)
            .field("customer_key", &"<redacted>")
            .finish()
    }
}

/// Options applied to every upload of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_encoding: Option<String>,
    pub server_side_encryption: Option<ServerSideEncryption>,
}

impl UploadOptions {
    pub fn from_config(buffer: &BufferConfig, upload: &UploadConfig) -> Self {
        let server_side_encryption = match (
            &upload.server_side_encryption_algorithm,
            &upload.customer_key,
        ) {
            (Some(algorithm), Some(key)) => Some(ServerSideEncryption {
                algorithm: algorithm.clone(),
                customer_key: key.as_bytes().to_vec(),
            }),
            _ => None,
        };

        Self {
            content_encoding: buffer.encoding.content_encoding().map(str::to_string),
            server_side_encryption,
        }
    }

    /// Request headers derived from these options
    pub fn headers(&self) -> ObjectHeaders {
        ObjectHeaders {
            content_encoding: self.content_encoding.clone(),
            encryption: self
                .server_side_encryption
                .as_ref()
                .map(|sse| EncryptionHeaders::new(&sse.algorithm, &sse.customer_key)),
        }
    }
}
