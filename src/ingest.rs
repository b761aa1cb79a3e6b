//! Photo-created event handling
//!
//! The ingestion pipeline hands over the preview, the optional thumbnail and
//! one crop per detected face. Each asset is uploaded and its coordinates
//! written independently; assets of the same photo run concurrently.
//! Delivery is at-least-once: keys are deterministic, so a redelivered event
//! overwrites the same objects and rows.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blob::{keys, ContentAddressableUploader, ObjectStore};
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceId, PhotoAsset, PhotoId};
use crate::storage::CatalogStore;
use crate::summary::BatchSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceImage {
    pub face_id: FaceId,
    pub image: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoCreated {
    pub photo_id: PhotoId,
    pub storage_name: String,
    pub relative_path: Option<String>,
    pub preview: Bytes,
    pub thumbnail: Option<Bytes>,
    pub faces: Vec<FaceImage>,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Photo(PhotoId, PhotoAsset),
    Face(FaceId),
}

struct AssetJob {
    target: Target,
    key: String,
    data: Bytes,
}

pub struct PhotoCreatedHandler<C: CatalogStore, O: ObjectStore + ?Sized> {
    catalog: Arc<C>,
    uploader: ContentAddressableUploader<O>,
}

impl<C: CatalogStore, O: ObjectStore + ?Sized> PhotoCreatedHandler<C, O> {
    pub fn new(catalog: Arc<C>, uploader: ContentAddressableUploader<O>) -> Self {
        Self { catalog, uploader }
    }

    pub async fn handle(&self, event: &PhotoCreated, cancel: &CancellationToken) -> BatchSummary {
        let jobs = plan(event);
        let results = join_all(jobs.into_iter().map(|job| self.run_job(job, cancel))).await;

        let mut summary = BatchSummary::new(format!("photo {} blobs", event.photo_id));
        for (key, result) in results {
            match result {
                Ok(()) => summary.record_success(),
                Err(SyncError::Cancelled) => summary.abort("cancelled"),
                Err(err) => summary.record_failure(key, &err),
            }
        }

        info!(
            "Photo {}: stored {} assets, {} failed",
            event.photo_id, summary.succeeded, summary.failed
        );
        summary
    }

    async fn run_job(&self, job: AssetJob, cancel: &CancellationToken) -> (String, SyncResult<()>) {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.store_asset(&job) => result,
        };
        (job.key, result)
    }

    async fn store_asset(&self, job: &AssetJob) -> SyncResult<()> {
        let coords = self.uploader.upload(&job.key, job.data.clone()).await?;

        let written = match job.target {
            Target::Photo(id, asset) => self.catalog.set_photo_blob(id, asset, &coords).await,
            Target::Face(id) => self.catalog.set_face_blob(id, &coords).await,
        };

        match written {
            Ok(()) => Ok(()),
            // only a missing row proves nothing references the key
            Err(err @ SyncError::NotFound { .. }) => {
                if let Err(cleanup) = self.uploader.store().delete(&job.key).await {
                    warn!("Failed to remove orphaned object {}: {}", job.key, cleanup);
                }
                Err(err)
            }
            Err(err) => {
                warn!(
                    "Keeping object {} after failed catalog write, a previous delivery may reference it: {}",
                    job.key, err
                );
                Err(err)
            }
        }
    }
}

fn plan(event: &PhotoCreated) -> Vec<AssetJob> {
    let relative = event.relative_path.as_deref();
    let mut jobs = Vec::with_capacity(2 + event.faces.len());

    jobs.push(AssetJob {
        target: Target::Photo(event.photo_id, PhotoAsset::Preview),
        key: keys::photo_key(PhotoAsset::Preview, &event.storage_name, relative, event.photo_id),
        data: event.preview.clone(),
    });

    if let Some(thumbnail) = &event.thumbnail {
        jobs.push(AssetJob {
            target: Target::Photo(event.photo_id, PhotoAsset::Thumbnail),
            key: keys::photo_key(PhotoAsset::Thumbnail, &event.storage_name, relative, event.photo_id),
            data: thumbnail.clone(),
        });
    }

    for face in &event.faces {
        jobs.push(AssetJob {
            target: Target::Face(face.face_id),
            key: keys::face_key(face.face_id),
            data: face.image.clone(),
        });
    }

    jobs
}
