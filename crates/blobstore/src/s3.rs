//! S3 backend.
//!
//! Thin mapping of the [`ObjectStore`] contract onto aws-sdk-s3; URLs are
//! presigned GETs, assembly uses native multipart uploads.

use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::{validate_key, BlobMetadata, MultipartWriter, ObjectStore, Result, StoreError};

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, content: Bytes, metadata: BlobMetadata) -> Result<String> {
        validate_key(key)?;
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.to_vec()))
            .content_type(&metadata.content_type);
        for (k, v) in &metadata.custom {
            req = req.metadata(k, v);
        }
        req.send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("put_object: {e}")))?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Unavailable(format!("get_object: {service}"))
                }
            })?;
        let data = out
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Unavailable(format!("get_object body: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Unavailable(format!("presign config: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| StoreError::Unavailable(format!("presign: {e}")))?;
        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "best-effort S3 delete failed");
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .is_ok()
    }

    async fn stat(&self, key: &str) -> Result<BlobMetadata> {
        validate_key(key)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Unavailable(format!("head_object: {service}"))
                }
            })?;

        let mut metadata = BlobMetadata {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head.content_type().unwrap_or_default().to_string(),
            modified_at: None,
            custom: Default::default(),
        };
        if let Some(custom) = head.metadata() {
            for (k, v) in custom {
                metadata.custom.insert(k.clone(), v.clone());
            }
        }
        Ok(metadata)
    }

    async fn begin_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<Box<dyn MultipartWriter>> {
        validate_key(key)?;
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("create_multipart: {e}")))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Unavailable("multipart upload id missing".to_string()))?
            .to_string();

        Ok(Box::new(S3Multipart {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
        }))
    }
}

struct S3Multipart {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

#[async_trait::async_trait]
impl MultipartWriter for S3Multipart {
    async fn write_part(&mut self, part: Bytes) -> Result<()> {
        let part_number = self.parts.len() as i32 + 1;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("upload_part: {e}")))?;
        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(uploaded.e_tag().unwrap_or_default())
                .build(),
        );
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<String> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(self.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("complete_multipart: {e}")))?;
        Ok(self.key.clone())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("abort_multipart: {e}")))?;
        Ok(())
    }
}
