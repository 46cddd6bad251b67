//! Object-store side of the transfer engine.
//!
//! [ChapterStore] is the narrow surface the engine needs: multipart
//! primitives, single-shot puts, existence checks, deletes and presigned GET
//! issuance. [S3ChapterStore] is the production implementation.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Sdk(String),
    #[error("multipart upload id missing from create response")]
    MissingUploadId,
    #[error("part etag missing from upload response")]
    MissingEtag,
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn sdk_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Sdk(e.to_string())
}

/// One completed multipart part, as needed to finish the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Storage operations consumed by the transfer engine and the orchestrator.
#[async_trait::async_trait]
pub trait ChapterStore: Send + Sync {
    /// Cheap existence probe; the idempotence short-circuit.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Size of an existing object, `None` when absent.
    async fn head_size(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn create_multipart(&self, key: &str) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError>;

    /// Abort frees the storage held by uploaded parts; errors here are
    /// logged by callers but never escalate past the original failure.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError>;

    async fn put_file(&self, path: &Path, key: &str) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// `(key, size)` pairs under a prefix, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;
}

/// S3-backed store.
#[derive(Clone)]
pub struct S3ChapterStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ChapterStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        S3ChapterStore {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a store from the ambient AWS environment for `region`.
    pub async fn from_env(region: &str, bucket: impl Into<String>) -> Self {
        let cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        S3ChapterStore::new(aws_sdk_s3::Client::new(&cfg), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait::async_trait]
impl ChapterStore for S3ChapterStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.head_size(key).await?.is_some())
    }

    async fn head_size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(out.content_length().map(|len| len.max(0) as u64).or(Some(0))),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(sdk_err(service_err))
                }
            }
        }
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StoreError> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("video/mp4")
            .send()
            .await
            .map_err(sdk_err)?;
        let upload_id = out.upload_id().ok_or(StoreError::MissingUploadId)?;
        debug!("created multipart upload for s3://{}/{key}", self.bucket);
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_err)?;
        let etag = out.e_tag().ok_or(StoreError::MissingEtag)?.to_string();
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();
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
            .map_err(sdk_err)?;
        info!("completed multipart upload for s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_err)?;
        warn!("aborted multipart upload for s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn put_file(&self, path: &Path, key: &str) -> Result<u64, StoreError> {
        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path).await.map_err(sdk_err)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("video/mp4")
            .body(body)
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let mut out = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk_err)?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().map(|s| s.max(0) as u64).unwrap_or(0);
                    out.push((key.to_string(), size));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let cfg = PresigningConfig::expires_in(expires_in).map_err(sdk_err)?;
        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(cfg)
            .await
            .map_err(sdk_err)?;
        Ok(req.uri().to_string())
    }
}
