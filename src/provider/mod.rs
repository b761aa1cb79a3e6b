//! Face provider abstraction
//!
//! One capability interface over three vendors. Vendors differ in their
//! identity model: some identify previously enrolled face ids, others only
//! match a raw image against known users. Callers dispatch on
//! [`ProviderCapabilities`], never on the concrete type.

pub(crate) mod http;

pub mod azure;
pub mod local;
pub mod rekognition;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ProviderKindConfig};
use crate::error::SyncResult;
use crate::model::{FaceId, PersonId};
use crate::storage::CatalogStore;

pub use azure::AzureFaceProvider;
pub use local::LocalFaceProvider;
pub use rekognition::RekognitionFaceProvider;

/// Closed set of provider variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    Azure,
    Rekognition,
    Local,
}

impl ProviderKind {
    /// Value stored in the catalog's `provider` columns
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Azure => "azure",
            ProviderKind::Rekognition => "rekognition",
            ProviderKind::Local => "local",
        }
    }
}

impl From<ProviderKindConfig> for ProviderKind {
    fn from(kind: ProviderKindConfig) -> Self {
        match kind {
            ProviderKindConfig::Azure => ProviderKind::Azure,
            ProviderKindConfig::Rekognition => ProviderKind::Rekognition,
            ProviderKindConfig::Local => ProviderKind::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// `identify` resolves previously enrolled or detected face ids
    pub identify_by_id: bool,
    /// `search_users_by_image` matches a raw crop
    pub search_by_image: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonSyncItem {
    pub person_id: PersonId,
    pub name: String,
    pub external_id: Option<String>,
}

/// A face crop to enroll. The image is shared, so cloning is cheap and each
/// attempt reads the same bytes.
#[derive(Debug, Clone)]
pub struct FaceToLink {
    pub face_id: FaceId,
    pub image: Bytes,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace {
    /// Empty when the vendor assigns no id on detection
    pub provider_face_id: String,
    pub confidence: Option<f32>,
    pub age: Option<f32>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyCandidate {
    pub provider_person_id: String,
    /// Normalised to 0..1
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyResult {
    pub provider_face_id: String,
    pub candidates: Vec<IdentifyCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMatch {
    pub provider_person_id: String,
    /// Normalised to 0..1
    pub confidence: f32,
}

#[async_trait]
pub trait FaceProvider: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Score an automatic assignment must reach, when the provider's scores
    /// live on a scale of their own. `None` defers to the sync threshold.
    fn confidence_threshold(&self) -> Option<f32> {
        None
    }

    /// Make sure the vendor-side container (group, collection, service) exists.
    /// Fails with `ProviderUnavailable` when it cannot be reached.
    async fn ensure_ready(&self) -> SyncResult<()>;

    /// Idempotent upsert. Returns local person id -> provider person id.
    async fn upsert_persons(
        &self,
        persons: &[PersonSyncItem],
    ) -> SyncResult<HashMap<PersonId, String>>;

    /// Enroll crops under one person. Faces the vendor refuses are left out of
    /// the returned map instead of failing the call.
    async fn link_faces_to_person(
        &self,
        person_id: PersonId,
        person_external_id: &str,
        faces: &[FaceToLink],
    ) -> SyncResult<HashMap<FaceId, String>>;

    async fn detect(&self, image: &[u8]) -> SyncResult<Vec<DetectedFace>>;

    /// Providers without id-based identify return an empty list.
    async fn identify(&self, provider_face_ids: &[String]) -> SyncResult<Vec<IdentifyResult>>;

    /// Providers without image search return an empty list.
    async fn search_users_by_image(&self, image: &[u8]) -> SyncResult<Vec<UserMatch>>;
}

/// Build the provider selected by `provider.kind`
pub async fn build_provider<C: CatalogStore>(
    config: &Config,
    catalog: Arc<C>,
) -> SyncResult<Arc<dyn FaceProvider>> {
    let provider: Arc<dyn FaceProvider> = match ProviderKind::from(config.provider.kind) {
        ProviderKind::Azure => Arc::new(AzureFaceProvider::new(config.provider.azure.clone())?),
        ProviderKind::Rekognition => Arc::new(
            RekognitionFaceProvider::connect(config.provider.rekognition.clone()).await,
        ),
        ProviderKind::Local => {
            Arc::new(LocalFaceProvider::new(config.provider.local.clone(), catalog)?)
        }
    };
    Ok(provider)
}
