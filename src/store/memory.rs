//! In-process object store
//!
//! Keeps objects and in-flight multipart uploads in memory and remembers
//! every completion, so tests can check exactly what the pipeline sent.
//! Failures can be injected per operation.

use super::{ObjectHeaders, ObjectStore, Payload, StoreError, UploadedPart};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Initiate,
    UploadPart,
    Complete,
    ListParts,
}

/// An object as it was stored
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub headers: ObjectHeaders,
    /// Number of parts, or `None` for a single-shot upload
    pub parts: Option<usize>,
}

/// Record of a finished multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub key: String,
    pub upload_id: String,
    pub part_numbers: Vec<u32>,
}

struct PendingUpload {
    key: String,
    headers: ObjectHeaders,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, StoredObject>,
    pending: HashMap<String, PendingUpload>,
    completed: Vec<CompletedUpload>,
    put_count: usize,
    part_uploads: Vec<(String, u32)>,
    failures: HashMap<StoreOp, Vec<StoreError>>,
    next_upload_id: u64,
}

impl MemoryState {
    fn take_failure(&mut self, op: StoreOp) -> Result<(), StoreError> {
        match self.failures.get_mut(&op).and_then(|queue| queue.pop()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.state.lock().failures.entry(op).or_default().insert(0, err);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Keys of every stored object, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn completed_uploads(&self) -> Vec<CompletedUpload> {
        self.state.lock().completed.clone()
    }

    /// Number of successful single-shot uploads
    pub fn put_count(&self) -> usize {
        self.state.lock().put_count
    }

    /// `(upload id, part number)` of every accepted part, in arrival order
    pub fn part_uploads(&self) -> Vec<(String, u32)> {
        self.state.lock().part_uploads.clone()
    }

    /// Ids of multipart uploads that were started but not completed
    pub fn pending_uploads(&self) -> Vec<String> {
        self.state.lock().pending.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        payload: Payload,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Put)?;

        let etag = format!("\"{}\"", payload.md5_hex());
        state.put_count += 1;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body: payload.body().clone(),
                headers: headers.clone(),
                parts: None,
            },
        );
        Ok(Some(etag))
    }

    async fn initiate_multipart_upload(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Initiate)?;

        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.pending.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                headers: headers.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        _headers: &ObjectHeaders,
        upload_id: &str,
        part_number: u32,
        payload: Payload,
    ) -> Result<UploadedPart, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::UploadPart)?;

        let pending = state
            .pending
            .get_mut(upload_id)
            .filter(|pending| pending.key == key)
            .ok_or_else(|| StoreError::Protocol(format!("no such upload {}", upload_id)))?;
        pending.parts.insert(part_number, payload.body().clone());
        state
            .part_uploads
            .push((upload_id.to_string(), part_number));

        Ok(UploadedPart {
            part_number,
            size: payload.len() as u64,
            etag: Some(format!("\"{}\"", payload.md5_hex())),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::Complete)?;

        let pending = state
            .pending
            .remove(upload_id)
            .filter(|pending| pending.key == key)
            .ok_or_else(|| StoreError::Protocol(format!("no such upload {}", upload_id)))?;

        let mut body = BytesMut::new();
        for part in parts {
            let data = pending.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Protocol(format!("part {} was never uploaded", part.part_number))
            })?;
            body.extend_from_slice(data);
        }

        state.objects.insert(
            key.to_string(),
            StoredObject {
                body: body.freeze(),
                headers: pending.headers,
                parts: Some(parts.len()),
            },
        );
        state.completed.push(CompletedUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_numbers: parts.iter().map(|part| part.part_number).collect(),
        });
        Ok(())
    }

    async fn list_multipart_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, StoreError> {
        let mut state = self.state.lock();
        state.take_failure(StoreOp::ListParts)?;

        let pending = state
            .pending
            .get(upload_id)
            .filter(|pending| pending.key == key)
            .ok_or_else(|| StoreError::Protocol(format!("no such upload {}", upload_id)))?;

        Ok(pending
            .parts
            .iter()
            .map(|(number, data)| UploadedPart {
                part_number: *number,
                size: data.len() as u64,
                etag: Some(format!("\"{}\"", Payload::new(data.clone()).md5_hex())),
            })
            .collect())
    }
}
