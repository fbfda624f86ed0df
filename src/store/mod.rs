//! Remote object store
//!
//! The upload side only talks to an [`ObjectStore`]. [`s3::S3Store`] backs it
//! with the AWS SDK; [`memory::MemoryStore`] keeps everything in process and
//! records each call, which is what the tests observe.
//!
//! Part numbers are zero based everywhere in this crate. Backends that count
//! from one translate at their boundary.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use thiserror::Error;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Object store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The request did not get a usable answer (network, auth, 5xx)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The store answered, but not with what the protocol requires
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// SSE-C headers sent with every write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeaders {
    pub algorithm: String,
    pub key_base64: String,
    pub key_md5_base64: String,
}

impl EncryptionHeaders {
    /// Derive the headers for a raw customer key
    pub fn new(algorithm: &str, customer_key: &[u8]) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            key_base64: STANDARD.encode(customer_key),
            key_md5_base64: STANDARD.encode(Md5::digest(customer_key)),
        }
    }
}

/// Headers common to every write of one object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_encoding: Option<String>,
    pub encryption: Option<EncryptionHeaders>,
}

/// A request body together with its MD5 checksum
#[derive(Debug, Clone)]
pub struct Payload {
    body: Bytes,
    md5: [u8; 16],
}

impl Payload {
    pub fn new(body: Bytes) -> Self {
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&Md5::digest(&body));
        Self { body, md5 }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    /// Checksum in the form of the `Content-MD5` header
    pub fn md5_base64(&self) -> String {
        STANDARD.encode(self.md5)
    }
}

/// A part the store has accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub size: u64,
    pub etag: Option<String>,
}

/// Operations the upload pipeline needs from a remote store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single-shot upload; returns the ETag if the store sent one
    async fn put_object(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        payload: Payload,
    ) -> Result<Option<String>, StoreError>;

    /// Start a multipart upload and return its upload id
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        upload_id: &str,
        part_number: u32,
        payload: Payload,
    ) -> Result<UploadedPart, StoreError>;

    /// Finish the upload from `parts`, which must be in part-number order
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError>;

    /// Parts already stored for `upload_id`, sorted by part number
    async fn list_multipart_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, StoreError>;
}
