//! Catalog abstraction traits
//!
//! The relational catalog is the source of truth for photos, faces and
//! persons. Only the blob writers and the face catalog service mutate
//! storage coordinates and identity columns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::model::{
    BlobCoordinates, FaceAssignment, FaceId, FaceRecord, PersonId, PersonRecord, PersonRef,
    PhotoAsset, PhotoId, PhotoRecord,
};

/// Embedding stored for the local provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub face_id: FaceId,
    pub person_id: PersonId,
    pub vector: Vec<f32>,
    pub model: String,
}

/// Catalog trait
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    // --- ingestion-side inserts (rows are created by the ingestion pipeline) ---

    async fn insert_photo(
        &self,
        id: PhotoId,
        storage_name: &str,
        relative_path: Option<&str>,
    ) -> SyncResult<()>;

    async fn insert_face(&self, id: FaceId, photo_id: PhotoId) -> SyncResult<()>;

    async fn insert_person(&self, id: PersonId, name: &str) -> SyncResult<()>;

    // --- photos ---

    async fn get_photo(&self, id: PhotoId) -> SyncResult<Option<PhotoRecord>>;

    /// Write all four coordinate columns of one photo asset in one statement
    async fn set_photo_blob(
        &self,
        id: PhotoId,
        asset: PhotoAsset,
        blob: &BlobCoordinates,
    ) -> SyncResult<()>;

    // --- faces ---

    async fn get_face(&self, id: FaceId) -> SyncResult<Option<FaceRecord>>;

    /// Write all four coordinate columns of a face crop in one statement
    async fn set_face_blob(&self, id: FaceId, blob: &BlobCoordinates) -> SyncResult<()>;

    /// Faces ordered by id
    async fn list_faces(&self, offset: i64, limit: i64) -> SyncResult<Vec<FaceRecord>>;

    async fn count_faces(&self) -> SyncResult<i64>;

    /// Apply a manual identity decision. Returns false when the face does not exist.
    async fn apply_assignment(&self, id: FaceId, assignment: FaceAssignment) -> SyncResult<bool>;

    /// Record an automatic identification. Only unresolved faces are touched;
    /// returns false when the face was not unresolved anymore.
    async fn record_identification(
        &self,
        id: FaceId,
        person_id: PersonId,
        confidence: f64,
    ) -> SyncResult<bool>;

    /// Unresolved faces that already have a stored image
    async fn unresolved_faces(&self) -> SyncResult<Vec<FaceRecord>>;

    /// Identified faces with a stored image that `provider` has not enrolled yet
    async fn faces_pending_enrollment(&self, provider: &str) -> SyncResult<Vec<FaceRecord>>;

    async fn set_face_enrollment(
        &self,
        id: FaceId,
        external_face_id: &str,
        provider: &str,
    ) -> SyncResult<()>;

    /// Faces assigned to `person_id` that have a stored image
    async fn faces_for_person(&self, person_id: PersonId) -> SyncResult<Vec<FaceRecord>>;

    // --- persons ---

    async fn get_person(&self, id: PersonId) -> SyncResult<Option<PersonRecord>>;

    async fn list_persons(&self) -> SyncResult<Vec<PersonRecord>>;

    /// Persons owned by `provider` (or by nobody yet). Unless `full` is set,
    /// only those without an external id are returned.
    async fn persons_for_sync(&self, provider: &str, full: bool) -> SyncResult<Vec<PersonRecord>>;

    async fn set_person_external_id(
        &self,
        id: PersonId,
        external_id: &str,
        provider: &str,
    ) -> SyncResult<()>;

    /// Persons that currently have at least one identified face
    async fn persons_with_faces(&self) -> SyncResult<Vec<PersonRef>>;

    // --- local provider embeddings ---

    async fn upsert_embedding(&self, embedding: &StoredEmbedding) -> SyncResult<()>;

    async fn all_embeddings(&self) -> SyncResult<Vec<StoredEmbedding>>;
}
