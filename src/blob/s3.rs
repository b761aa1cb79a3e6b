//! S3 / MinIO object store

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Credentials, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body::Frame;
use http_body_util::StreamBody;
use tracing::{debug, info};

use super::store::{ObjectStat, ObjectStore, PutBody};
use crate::config::ObjectStoreConfig;
use crate::error::{SyncError, SyncResult};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(config: &ObjectStoreConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "static",
            ));
        }

        let base_config = loader.load().await;
        let s3_config = S3ConfigBuilder::from(&base_config)
            .force_path_style(config.force_path_style)
            .build();

        info!("S3 object store ready (bucket {})", config.bucket);
        Self::with_client(Client::from_conf(s3_config), config.bucket.clone())
    }

    pub fn with_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

fn unavailable<E: std::error::Error>(err: E) -> SyncError {
    SyncError::StorageUnavailable(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: PutBody,
        size: u64,
        content_type: &str,
    ) -> SyncResult<()> {
        // chunks go to the wire as they are produced; the length must be known up front
        let stream = ByteStream::from_body_1_x(StreamBody::new(body.map_ok(Frame::data)));

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(size as i64)
            .body(stream)
            .send()
            .await
            .map_err(unavailable)?;

        debug!("Put s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn stat(&self, key: &str) -> SyncResult<Option<ObjectStat>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectStat {
                etag: output.e_tag().map(str::to_string),
                size: output.content_length().unwrap_or_default(),
            })),
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if missing {
                    Ok(None)
                } else {
                    Err(unavailable(err))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> SyncResult<Bytes> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                return Err(if missing {
                    SyncError::StorageIntegrity {
                        key: key.to_string(),
                        reason: "object is missing".to_string(),
                    }
                } else {
                    unavailable(err)
                });
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("read {}: {}", key, e)))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> SyncResult<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| SyncError::StorageUnavailable(format!("presign config: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(unavailable)?;
        Ok(request.uri().to_string())
    }
}
