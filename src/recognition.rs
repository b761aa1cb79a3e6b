//! Auxiliary recognizer registration
//!
//! Pushes crops of faces assigned to the seed person to a separate
//! recognition service. That service only aids matching, so failures are
//! logged per face and nothing is rolled back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::blob::ObjectStore;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceId, PersonId};
use crate::provider::http::{check, client, transport_error};
use crate::storage::CatalogStore;
use crate::summary::BatchSummary;

#[async_trait]
pub trait RecognitionClient: Send + Sync + 'static {
    async fn register(&self, person_id: PersonId, face_id: FaceId, image: Bytes) -> SyncResult<()>;
}

pub struct HttpRecognitionClient {
    http: Client,
    base_url: String,
}

impl HttpRecognitionClient {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        Ok(Self {
            http: client(Duration::from_secs(30))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RecognitionClient for HttpRecognitionClient {
    async fn register(&self, person_id: PersonId, face_id: FaceId, image: Bytes) -> SyncResult<()> {
        let part = multipart::Part::bytes(image.to_vec())
            .file_name(format!("{}.jpg", face_id))
            .mime_str("image/jpeg")
            .map_err(|e| transport_error("/register", e))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .query(&[("person_id", person_id)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("/register", e))?;
        check("/register", response).await?;
        Ok(())
    }
}

pub struct RecognitionRegistrationService<C: CatalogStore> {
    catalog: Arc<C>,
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn RecognitionClient>,
    seed_person_id: PersonId,
}

impl<C: CatalogStore> RecognitionRegistrationService<C> {
    pub fn new(
        catalog: Arc<C>,
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn RecognitionClient>,
        seed_person_id: PersonId,
    ) -> Self {
        Self {
            catalog,
            store,
            client,
            seed_person_id,
        }
    }

    /// Register every stored face of the seed person. Only a catalog failure
    /// or cancellation stops the batch early.
    pub async fn register_identified_faces(&self, cancel: &CancellationToken) -> BatchSummary {
        let mut summary = BatchSummary::new("register faces");

        let faces = match self.catalog.faces_for_person(self.seed_person_id).await {
            Ok(faces) => faces,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        debug!("{} faces to register for person {}", faces.len(), self.seed_person_id);

        for face in faces {
            let Some(image) = face.image else { continue };

            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                pushed = self.push(face.id, &image.key) => pushed,
            };

            match pushed {
                Ok(()) => summary.record_success(),
                Err(SyncError::Cancelled) => {
                    summary.abort("cancelled");
                    break;
                }
                Err(err) => summary.record_failure(face.id, &err),
            }
        }

        info!(
            "Registered {} faces with the recognizer ({} failed)",
            summary.succeeded, summary.failed
        );
        summary
    }

    async fn push(&self, face_id: FaceId, key: &str) -> SyncResult<()> {
        let image = self.store.get(key).await?;
        self.client.register(self.seed_person_id, face_id, image).await
    }
}
