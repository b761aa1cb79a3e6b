//! AWS Rekognition provider (collection users)
//!
//! The local person id is used as the Rekognition user id, so upserts are
//! naturally idempotent. Matching is image based only.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_rekognition::{
    config::Region,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{Attribute, Image, QualityFilter},
    Client,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    DetectedFace, FaceProvider, FaceToLink, IdentifyResult, PersonSyncItem,
    ProviderCapabilities, ProviderKind, UserMatch,
};
use crate::config::RekognitionConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceId, PersonId};

const PAGE_SIZE: i32 = 500;
const MAX_USERS: i32 = 10;

pub struct RekognitionFaceProvider {
    client: Client,
    config: RekognitionConfig,
}

impl RekognitionFaceProvider {
    pub async fn connect(config: RekognitionConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;
        Self::with_client(Client::new(&shared), config)
    }

    pub fn with_client(client: Client, config: RekognitionConfig) -> Self {
        Self { client, config }
    }

    fn image(bytes: &[u8]) -> Image {
        Image::builder().bytes(Blob::new(bytes.to_vec())).build()
    }

    /// Create the user, treating one that already exists as done.
    async fn create_user(&self, user_id: &str) -> SyncResult<()> {
        match self
            .client
            .create_user()
            .collection_id(&self.config.collection_id)
            .user_id(user_id)
            .send()
            .await
        {
            Ok(_) => {
                debug!("Created Rekognition user {}", user_id);
                Ok(())
            }
            Err(err) if error_code(&err) == Some("ConflictException") => {
                debug!("Rekognition user {} already exists", user_id);
                Ok(())
            }
            Err(err) => Err(classify("CreateUser", err)),
        }
    }

    fn quality_filter(&self) -> QualityFilter {
        QualityFilter::from(self.config.quality_filter.as_str())
    }

    async fn existing_users(&self) -> SyncResult<HashSet<String>> {
        let mut users = HashSet::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_users()
                .collection_id(&self.config.collection_id)
                .max_results(PAGE_SIZE)
                .set_next_token(token.take())
                .send()
                .await
                .map_err(|e| classify("ListUsers", e))?;
            users.extend(page.users().iter().filter_map(|u| u.user_id().map(str::to_string)));
            match page.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(users)
    }

    async fn user_faces(&self, user_id: &str) -> SyncResult<HashSet<String>> {
        let mut faces = HashSet::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_faces()
                .collection_id(&self.config.collection_id)
                .user_id(user_id)
                .max_results(PAGE_SIZE)
                .set_next_token(token.take())
                .send()
                .await
                .map_err(|e| classify("ListFaces", e))?;
            faces.extend(page.faces().iter().filter_map(|f| f.face_id().map(str::to_string)));
            match page.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(faces)
    }

    /// Index one crop and associate it with the user. `Ok(None)` when no face was indexed.
    async fn enroll(
        &self,
        user_id: &str,
        face: &FaceToLink,
        associated: &Mutex<HashSet<String>>,
    ) -> SyncResult<Option<String>> {
        let indexed = self
            .client
            .index_faces()
            .collection_id(&self.config.collection_id)
            .image(Self::image(&face.image))
            .max_faces(1)
            .detection_attributes(Attribute::Default)
            .quality_filter(self.quality_filter())
            .send()
            .await
            .map_err(|e| classify("IndexFaces", e))?;

        let Some(rekognition_id) = indexed
            .face_records()
            .first()
            .and_then(|r| r.face())
            .and_then(|f| f.face_id())
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let known = associated.lock().contains(&rekognition_id);
        if !known {
            self.client
                .associate_faces()
                .collection_id(&self.config.collection_id)
                .user_id(user_id)
                .face_ids(&rekognition_id)
                .send()
                .await
                .map_err(|e| classify("AssociateFaces", e))?;
            associated.lock().insert(rekognition_id.clone());
            debug!("Associated face {} with user {}", rekognition_id, user_id);
        }
        Ok(Some(rekognition_id))
    }
}

fn error_code<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> Option<&str> {
    err.as_service_error().and_then(|e| e.code())
}

/// Map an SDK failure onto the error taxonomy by service error code.
fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> SyncError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = error_code(&err).map(str::to_string);
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));

    match code.as_deref() {
        Some(code) if is_unauthorized(code) => SyncError::ProviderUnauthorized(message),
        Some(code) if is_rejection(code) => SyncError::ProviderRejected(message),
        _ => SyncError::provider_unavailable(message),
    }
}

fn is_unauthorized(code: &str) -> bool {
    matches!(
        code,
        "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException"
    )
}

fn is_rejection(code: &str) -> bool {
    matches!(
        code,
        "InvalidParameterException"
            | "InvalidImageFormatException"
            | "ImageTooLargeException"
            | "InvalidS3ObjectException"
    )
}

#[async_trait]
impl FaceProvider for RekognitionFaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Rekognition
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            identify_by_id: false,
            search_by_image: true,
        }
    }

    async fn ensure_ready(&self) -> SyncResult<()> {
        match self
            .client
            .describe_collection()
            .collection_id(&self.config.collection_id)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if error_code(&err) == Some("ResourceNotFoundException") => {}
            Err(err) => return Err(classify("DescribeCollection", err)),
        }

        match self
            .client
            .create_collection()
            .collection_id(&self.config.collection_id)
            .send()
            .await
        {
            Ok(_) => info!("Created Rekognition collection {}", self.config.collection_id),
            Err(err) if error_code(&err) == Some("ResourceAlreadyExistsException") => {
                debug!("Collection {} was created concurrently", self.config.collection_id)
            }
            Err(err) => return Err(classify("CreateCollection", err)),
        }
        Ok(())
    }

    async fn upsert_persons(
        &self,
        persons: &[PersonSyncItem],
    ) -> SyncResult<HashMap<PersonId, String>> {
        if persons.is_empty() {
            return Ok(HashMap::new());
        }

        let mut existing = self.existing_users().await?;
        let mut map = HashMap::with_capacity(persons.len());
        for item in persons {
            let user_id = item.person_id.to_string();
            if !existing.contains(&user_id) {
                match self.create_user(&user_id).await {
                    Ok(()) => {}
                    Err(SyncError::ProviderRejected(reason)) => {
                        warn!("Rekognition refused user {}: {}", user_id, reason);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
                existing.insert(user_id.clone());
            }
            map.insert(item.person_id, user_id);
        }
        Ok(map)
    }

    async fn link_faces_to_person(
        &self,
        person_id: PersonId,
        person_external_id: &str,
        faces: &[FaceToLink],
    ) -> SyncResult<HashMap<FaceId, String>> {
        let associated = Mutex::new(self.user_faces(person_external_id).await?);

        let enrollments: Vec<_> = faces
            .iter()
            .map(|face| {
                let associated = &associated;
                async move {
                    (
                        face.face_id,
                        self.enroll(person_external_id, face, associated).await,
                    )
                }
            })
            .collect();
        let outcomes: Vec<(FaceId, SyncResult<Option<String>>)> = stream::iter(enrollments)
            .buffer_unordered(self.config.max_parallelism.max(1))
            .collect()
            .await;

        let mut linked = HashMap::with_capacity(faces.len());
        for (face_id, outcome) in outcomes {
            match outcome {
                Ok(Some(rekognition_id)) => {
                    linked.insert(face_id, rekognition_id);
                }
                Ok(None) => {
                    warn!("No face indexed from crop {} (person {})", face_id, person_id);
                }
                Err(SyncError::ProviderRejected(reason)) => {
                    warn!("Rekognition refused face {} (person {}): {}", face_id, person_id, reason);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(linked)
    }

    async fn detect(&self, image: &[u8]) -> SyncResult<Vec<DetectedFace>> {
        let detected = self
            .client
            .detect_faces()
            .image(Self::image(image))
            .attributes(Attribute::All)
            .send()
            .await
            .map_err(|e| classify("DetectFaces", e))?;

        Ok(detected
            .face_details()
            .iter()
            .map(|detail| DetectedFace {
                // DetectFaces assigns no collection-wide id
                provider_face_id: String::new(),
                confidence: detail.confidence().map(|c| c / 100.0),
                age: detail.age_range().and_then(|range| match (range.low(), range.high()) {
                    (Some(low), Some(high)) => Some((low + high) as f32 / 2.0),
                    _ => None,
                }),
                gender: detail
                    .gender()
                    .and_then(|g| g.value())
                    .map(|v| v.as_str().to_string()),
            })
            .collect())
    }

    async fn identify(&self, _provider_face_ids: &[String]) -> SyncResult<Vec<IdentifyResult>> {
        Ok(Vec::new())
    }

    async fn search_users_by_image(&self, image: &[u8]) -> SyncResult<Vec<UserMatch>> {
        let found = self
            .client
            .search_users_by_image()
            .collection_id(&self.config.collection_id)
            .image(Self::image(image))
            .max_users(MAX_USERS)
            .user_match_threshold(self.config.face_match_threshold)
            .quality_filter(self.quality_filter())
            .send()
            .await
            .map_err(|e| classify("SearchUsersByImage", e))?;

        Ok(found
            .user_matches()
            .iter()
            .filter_map(|m| {
                let user_id = m.user().and_then(|u| u.user_id())?;
                Some(UserMatch {
                    provider_person_id: user_id.to_string(),
                    // Rekognition similarity is a percentage
                    confidence: m.similarity().unwrap_or_default() / 100.0,
                })
            })
            .collect())
    }
}
