//! Face catalog service
//!
//! Paginated face reads with resolved media urls, and the single entry point
//! for identity changes. Every identity change drops the cached person list
//! before returning.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info};

use super::cache::ReferenceDataCache;
use super::media::MediaUrlResolver;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceAssignment, FaceId, FaceRecord, IdentityStatus, PersonId, PersonRef, PhotoId};
use crate::storage::CatalogStore;

#[derive(Debug, Clone, Serialize)]
pub struct FaceView {
    pub id: FaceId,
    pub photo_id: PhotoId,
    pub person_id: Option<PersonId>,
    pub identity_status: IdentityStatus,
    pub confidence: f64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacePage {
    pub items: Vec<FaceView>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
}

pub struct FaceCatalogService<C: CatalogStore> {
    catalog: Arc<C>,
    urls: MediaUrlResolver,
    persons: ReferenceDataCache<Vec<PersonRef>>,
}

impl<C: CatalogStore> FaceCatalogService<C> {
    pub fn new(catalog: Arc<C>, urls: MediaUrlResolver) -> Self {
        Self {
            catalog,
            urls,
            persons: ReferenceDataCache::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<C> {
        &self.catalog
    }

    /// One page of faces ordered by id. Non-positive `page` or `page_size`
    /// are treated as 1.
    pub async fn get_faces_page(&self, page: i64, page_size: i64) -> SyncResult<FacePage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let offset = (page - 1).saturating_mul(page_size);

        let total_count = self.catalog.count_faces().await?;
        let faces = self.catalog.list_faces(offset, page_size).await?;
        let items = join_all(faces.into_iter().map(|face| self.view(face))).await;

        Ok(FacePage {
            items,
            total_count,
            page,
            page_size,
        })
    }

    async fn view(&self, face: FaceRecord) -> FaceView {
        let image_url = self
            .urls
            .resolve(face.image.as_ref().map(|b| b.key.as_str()))
            .await;
        FaceView {
            id: face.id,
            photo_id: face.photo_id,
            person_id: face.person_id,
            identity_status: face.identity_status,
            confidence: face.confidence,
            image_url,
        }
    }

    /// Manual identity decision.
    pub async fn update_face(&self, face_id: FaceId, assignment: FaceAssignment) -> SyncResult<()> {
        if let FaceAssignment::Assigned(person_id) = assignment {
            if self.catalog.get_person(person_id).await?.is_none() {
                return Err(SyncError::not_found("person", person_id));
            }
        }

        if !self.catalog.apply_assignment(face_id, assignment).await? {
            return Err(SyncError::not_found("face", face_id));
        }

        self.persons.invalidate();
        info!("Face {} updated: {:?}", face_id, assignment);
        Ok(())
    }

    /// Automatic identification from the sync engine. Faces that are no longer
    /// unresolved are left alone; returns whether the face was updated.
    pub async fn record_identification(
        &self,
        face_id: FaceId,
        person_id: PersonId,
        confidence: f64,
    ) -> SyncResult<bool> {
        let updated = self
            .catalog
            .record_identification(face_id, person_id, confidence)
            .await?;
        if updated {
            self.persons.invalidate();
            debug!("Face {} identified as person {} ({:.3})", face_id, person_id, confidence);
        }
        Ok(updated)
    }

    /// Persons that currently have identified faces
    pub async fn persons(&self) -> SyncResult<Arc<Vec<PersonRef>>> {
        self.persons
            .get_or_load(|| self.catalog.persons_with_faces())
            .await
    }
}
