//! Multipart upload
//!
//! A file is cut into equal segments no larger than [`MAX_PART_SIZE`]; the
//! last one may be shorter. Parts are sent one after another in part-number
//! order and the upload is completed with the full list `0..=last`.
//!
//! An interrupted upload can be resumed from its upload id: the segment size
//! is taken from the first stored part and sending continues at the first
//! part number the store does not have.

use crate::buffer::ClosedFile;
use crate::metrics;
use crate::store::{ObjectHeaders, ObjectStore, Payload, UploadedPart};
use crate::upload::UploadError;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub use crate::config::MAX_PART_SIZE;

/// Smallest part most stores accept. Not enforced here: the final part of a
/// file is allowed to be shorter, and segments are only ever bounded above.
pub const MIN_PART_SIZE: u64 = 4 * 1024 * 1024;

/// Halve `size`, rounding up, until it fits in one part
pub fn calculate_segment(size: u64) -> u64 {
    let mut segment = size;
    while segment > MAX_PART_SIZE {
        segment = segment.div_ceil(2);
    }
    segment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartState {
    Init,
    InProgress,
    Resumed,
    Completed,
}

/// Drives the multipart protocol for one file
pub struct MultipartUploader<'a> {
    store: &'a dyn ObjectStore,
    file: &'a ClosedFile,
    headers: ObjectHeaders,
    upload_id: Option<String>,
    parts: Vec<UploadedPart>,
    state: MultipartState,
}

impl<'a> MultipartUploader<'a> {
    pub fn new(store: &'a dyn ObjectStore, file: &'a ClosedFile, headers: ObjectHeaders) -> Self {
        Self {
            store,
            file,
            headers,
            upload_id: None,
            parts: Vec::new(),
            state: MultipartState::Init,
        }
    }

    pub fn state(&self) -> MultipartState {
        self.state
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn parts(&self) -> &[UploadedPart] {
        &self.parts
    }

    /// Fresh upload: initiate, send every part, complete
    pub async fn upload(&mut self) -> Result<(), UploadError> {
        self.initiate().await?;
        let segment = calculate_segment(self.file.size());
        self.upload_parts(0, segment).await?;
        self.complete().await
    }

    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(self),
        fields(key = %self.file.key()),
        err
    )]
    pub async fn initiate(&mut self) -> Result<String, UploadError> {
        let upload_id = self
            .store
            .initiate_multipart_upload(self.file.key(), &self.headers)
            .await?;

        tracing::debug!(key = %self.file.key(), upload_id = %upload_id, "Initiated multipart upload");

        self.upload_id = Some(upload_id.clone());
        self.state = MultipartState::InProgress;
        Ok(upload_id)
    }

    /// Send the file from part `start` onwards in `segment`-sized chunks
    pub async fn upload_parts(&mut self, start: u32, segment: u64) -> Result<(), UploadError> {
        let upload_id = self.require_upload_id()?;
        if segment == 0 {
            return Err(UploadError::Protocol(format!(
                "segment size for {} must be positive",
                self.file.key()
            )));
        }

        let mut source = tokio::fs::File::open(self.file.path()).await?;
        if start > 0 {
            source
                .seek(std::io::SeekFrom::Start(u64::from(start) * segment))
                .await?;
        }

        let mut part_number = start;
        loop {
            let mut chunk = Vec::new();
            (&mut source).take(segment).read_to_end(&mut chunk).await?;
            if chunk.is_empty() {
                break;
            }

            tracing::debug!(
                key = %self.file.key(),
                part_number = part_number,
                bytes = chunk.len(),
                "Uploading part"
            );

            let part = self
                .store
                .upload_part(
                    self.file.key(),
                    &self.headers,
                    &upload_id,
                    part_number,
                    Payload::new(Bytes::from(chunk)),
                )
                .await?;
            self.parts.push(part);
            part_number += 1;
        }

        Ok(())
    }

    /// Complete with every part from 0 to the last one sent
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self),
        fields(key = %self.file.key(), parts_count = self.parts.len()),
        err
    )]
    pub async fn complete(&mut self) -> Result<(), UploadError> {
        let upload_id = self.require_upload_id()?;

        if self.parts.is_empty() {
            return Err(UploadError::Protocol(format!(
                "no parts uploaded for {}",
                self.file.key()
            )));
        }
        ensure_contiguous(&self.parts)?;

        self.store
            .complete_multipart_upload(self.file.key(), &upload_id, &self.parts)
            .await?;
        self.state = MultipartState::Completed;

        metrics::record_multipart_upload_success(self.parts.len());
        tracing::debug!(key = %self.file.key(), parts = self.parts.len(), "Completed multipart upload");
        Ok(())
    }

    /// Continue an upload that a previous run started
    #[tracing::instrument(
        name = "upload.multipart.resume",
        skip(self),
        fields(key = %self.file.key()),
        err
    )]
    pub async fn resume(&mut self, upload_id: &str) -> Result<(), UploadError> {
        self.upload_id = Some(upload_id.to_string());
        self.state = MultipartState::Resumed;

        let listed = self
            .store
            .list_multipart_parts(self.file.key(), upload_id)
            .await?;
        ensure_contiguous(&listed)?;

        let segment = match listed.first() {
            Some(first) => first.size,
            None => calculate_segment(self.file.size()),
        };
        let next = u32::try_from(listed.len())
            .map_err(|_| UploadError::Protocol("too many listed parts".into()))?;

        tracing::debug!(
            key = %self.file.key(),
            upload_id = %upload_id,
            next_part = next,
            segment = segment,
            "Resuming multipart upload"
        );

        self.parts = listed;
        self.state = MultipartState::InProgress;
        self.upload_parts(next, segment).await?;
        self.complete().await
    }

    fn require_upload_id(&self) -> Result<String, UploadError> {
        self.upload_id
            .clone()
            .ok_or_else(|| UploadError::Protocol("multipart upload was not initiated".into()))
    }
}

fn ensure_contiguous(parts: &[UploadedPart]) -> Result<(), UploadError> {
    for (index, part) in parts.iter().enumerate() {
        if part.part_number as usize != index {
            return Err(UploadError::Protocol(format!(
                "expected part {} but found part {}",
                index, part.part_number
            )));
        }
    }
    Ok(())
}
