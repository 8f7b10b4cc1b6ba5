use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;
use tracing::debug;

use super::{ArtifactStore, StoredObject, UploadReference};
use crate::error::UploadError;

/// S3, or any S3-compatible store reachable through a custom endpoint.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the ambient AWS configuration, optionally pinned
    /// to a named credentials profile and a non-AWS endpoint.
    pub async fn from_env(
        bucket: impl Into<String>,
        endpoint_url: Option<&str>,
        profile: Option<&str>,
    ) -> Self {
        let mut loader = aws_config::from_env();
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        if let Some(url) = endpoint_url {
            loader = loader.endpoint_url(url);
        }
        let config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(endpoint_url.is_some())
            .build();
        Self::new(aws_sdk_s3::Client::from_conf(s3_config), bucket)
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn put(&self, local_path: &Path, key: &str) -> Result<UploadReference, UploadError> {
        let body = tokio::fs::read(local_path).await?;
        debug!(bucket = %self.bucket, key, bytes = body.len(), "PutObject");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("text/csv")
            .send()
            .await
            .map_err(|e| UploadError::Storage(DisplayErrorContext(&e).to_string()))?;

        Ok(UploadReference::new(format!("s3://{}/{}", self.bucket, key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, UploadError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| UploadError::Storage(DisplayErrorContext(&e).to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push(StoredObject {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
        }
        debug!(bucket = %self.bucket, prefix, count = objects.len(), "ListObjectsV2");
        Ok(objects)
    }
}
