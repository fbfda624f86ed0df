//! S3 backed object store
//!
//! # Tracing
//!
//! | Operation | Span Name |
//! |-----------|-----------|
//! | PutObject | `s3.put_object` |
//! | CreateMultipartUpload | `s3.create_multipart_upload` |
//! | UploadPart | `s3.upload_part` |
//! | CompleteMultipartUpload | `s3.complete_multipart_upload` |
//! | ListParts | `s3.list_parts` |

use super::{ObjectHeaders, ObjectStore, Payload, StoreError, UploadedPart};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;

/// [`ObjectStore`] on top of the AWS SDK client for one bucket
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from configuration.
    ///
    /// Static keys are used when both are configured; otherwise the default
    /// AWS credential chain applies. A custom endpoint switches to path-style
    /// addressing, which is what S3-compatible stores expect.
    pub async fn connect(config: &S3Config) -> Self {
        let region = Region::new(config.region.clone());

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "mizuchi-spool",
                )),
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::from_client(Client::from_conf(builder.build()), &config.bucket)
    }

    pub fn from_client(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn transport_error<E>(err: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Transport(DisplayErrorContext(err).to_string())
}

/// S3 numbers parts from 1
fn s3_part_number(part_number: u32) -> Result<i32, StoreError> {
    part_number
        .checked_add(1)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| StoreError::Protocol(format!("part number {} out of range", part_number)))
}

#[async_trait]
impl ObjectStore for S3Store {
    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, headers, payload),
        fields(s3.bucket = %self.bucket, s3.key = %key, upload.bytes = payload.len()),
        err
    )]
    async fn put_object(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        payload: Payload,
    ) -> Result<Option<String>, StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(payload.md5_base64())
            .content_length(payload.len() as i64)
            .body(ByteStream::from(payload.body().clone()));

        if let Some(ref encoding) = headers.content_encoding {
            request = request.content_encoding(encoding);
        }
        if let Some(ref sse) = headers.encryption {
            request = request
                .sse_customer_algorithm(&sse.algorithm)
                .sse_customer_key(&sse.key_base64)
                .sse_customer_key_md5(&sse.key_md5_base64);
        }

        let output = request.send().await.map_err(transport_error)?;
        Ok(output.e_tag().map(str::to_string))
    }

    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self, headers),
        fields(s3.bucket = %self.bucket, s3.key = %key),
        err
    )]
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        headers: &ObjectHeaders,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);

        if let Some(ref encoding) = headers.content_encoding {
            request = request.content_encoding(encoding);
        }
        if let Some(ref sse) = headers.encryption {
            request = request
                .sse_customer_algorithm(&sse.algorithm)
                .sse_customer_key(&sse.key_base64)
                .sse_customer_key_md5(&sse.key_md5_base64);
        }

        let output = request.send().await.map_err(transport_error)?;
        output
            .upload_id()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Protocol(format!("no upload id returned for {}", key)))
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, headers, payload),
        fields(
            s3.bucket = %self.bucket,
            s3.key = %key,
            s3.upload_id = %upload_id,
            s3.part_number = part_number,
            upload.bytes = payload.len()
        ),
        err
    )]
    async fn upload_part(
        &self,
        key: &str,
        headers: &ObjectHeaders,
        upload_id: &str,
        part_number: u32,
        payload: Payload,
    ) -> Result<UploadedPart, StoreError> {
        let size = payload.len() as u64;
        let mut request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(s3_part_number(part_number)?)
            .content_md5(payload.md5_base64())
            .content_length(payload.len() as i64)
            .body(ByteStream::from(payload.body().clone()));

        if let Some(ref sse) = headers.encryption {
            request = request
                .sse_customer_algorithm(&sse.algorithm)
                .sse_customer_key(&sse.key_base64)
                .sse_customer_key_md5(&sse.key_md5_base64);
        }

        let output = request.send().await.map_err(transport_error)?;
        Ok(UploadedPart {
            part_number,
            size,
            etag: output.e_tag().map(str::to_string),
        })
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(s3.bucket = %self.bucket, s3.key = %key, s3.upload_id = %upload_id, parts_count = parts.len()),
        err
    )]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        let completed = parts
            .iter()
            .map(|part| {
                Ok(CompletedPart::builder()
                    .part_number(s3_part_number(part.part_number)?)
                    .set_e_tag(part.etag.clone())
                    .build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    #[tracing::instrument(
        name = "s3.list_parts",
        skip(self),
        fields(s3.bucket = %self.bucket, s3.key = %key, s3.upload_id = %upload_id),
        err
    )]
    async fn list_multipart_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, StoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(transport_error)?;

            for part in output.parts() {
                let number = part
                    .part_number()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| StoreError::Protocol("listed part without a number".into()))?;
                let size = part
                    .size()
                    .ok_or_else(|| StoreError::Protocol("listed part without a size".into()))?;
                parts.push(UploadedPart {
                    part_number: (number - 1) as u32,
                    size: size as u64,
                    etag: part.e_tag().map(str::to_string),
                });
            }

            match (output.is_truncated(), output.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }

        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_numbers_are_shifted() {
        assert_eq!(s3_part_number(0).unwrap(), 1);
        assert_eq!(s3_part_number(9_999).unwrap(), 10_000);
        assert!(s3_part_number(u32::MAX - 1).is_err());
    }

    #[tokio::test]
    async fn test_connect_with_static_keys() {
        let config = S3Config {
            bucket: "logs".into(),
            region: "us-west-2".into(),
            endpoint: Some("http://localhost:9000".into()),
            access_key: Some("ak".into()),
            secret_key: Some("sk".into()),
        };

        let store = S3Store::connect(&config).await;
        assert_eq!(store.bucket(), "logs");
    }
}
