//! Local InsightFace provider
//!
//! Embeddings come from an InsightFace-compatible HTTP service and are kept
//! in the catalog. Matching is cosine similarity against every stored
//! embedding, best score per person.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{multipart, Client};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::http::{check, client, transport_error};
use super::{
    DetectedFace, FaceProvider, FaceToLink, IdentifyResult, PersonSyncItem,
    ProviderCapabilities, ProviderKind, UserMatch,
};
use crate::config::LocalConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceId, PersonId};
use crate::storage::{CatalogStore, StoredEmbedding};
use crate::utils::math::{cosine_similarity, l2_normalize};

const EXTERNAL_PREFIX: &str = "local:";

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDetectedFace {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub gender: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDetectResponse {
    #[serde(default)]
    pub faces: Vec<LocalDetectedFace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalEmbedResponse {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub model: Option<String>,
}

/// The InsightFace service endpoints the provider relies on
#[async_trait]
pub trait InsightFaceClient: Send + Sync + 'static {
    async fn health(&self) -> SyncResult<()>;

    async fn detect(&self, image: &[u8]) -> SyncResult<LocalDetectResponse>;

    async fn embed(&self, image: &[u8]) -> SyncResult<LocalEmbedResponse>;
}

pub struct HttpInsightFaceClient {
    http: Client,
    base_url: String,
}

impl HttpInsightFaceClient {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        Ok(Self {
            http: client(Duration::from_secs(60))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_image(&self, path: &str, image: &[u8], file_name: &str) -> SyncResult<reqwest::Response> {
        let part = multipart::Part::bytes(image.to_vec())
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")
            .map_err(|e| transport_error(path, e))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        check(path, response).await
    }
}

#[async_trait]
impl InsightFaceClient for HttpInsightFaceClient {
    async fn health(&self) -> SyncResult<()> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| transport_error("/health", e))?;
        // any non-success means the model server is not serving yet
        check("/health", response)
            .await
            .map_err(|e| SyncError::provider_unavailable(e.to_string()))?;
        Ok(())
    }

    async fn detect(&self, image: &[u8]) -> SyncResult<LocalDetectResponse> {
        self.post_image("/detect", image, "photo.jpg")
            .await?
            .json()
            .await
            .map_err(|e| transport_error("/detect", e))
    }

    async fn embed(&self, image: &[u8]) -> SyncResult<LocalEmbedResponse> {
        self.post_image("/embed", image, "face.jpg")
            .await?
            .json()
            .await
            .map_err(|e| transport_error("/embed", e))
    }
}

pub struct LocalFaceProvider<C: CatalogStore> {
    client: Arc<dyn InsightFaceClient>,
    catalog: Arc<C>,
    config: LocalConfig,
}

impl<C: CatalogStore> LocalFaceProvider<C> {
    pub fn new(config: LocalConfig, catalog: Arc<C>) -> SyncResult<Self> {
        let client = Arc::new(HttpInsightFaceClient::new(&config.base_url)?);
        Ok(Self::with_client(config, catalog, client))
    }

    pub fn with_client(
        config: LocalConfig,
        catalog: Arc<C>,
        client: Arc<dyn InsightFaceClient>,
    ) -> Self {
        Self {
            client,
            catalog,
            config,
        }
    }

    async fn enroll(&self, person_id: PersonId, face: &FaceToLink) -> SyncResult<String> {
        let embedded = self.client.embed(&face.image).await?;
        if embedded.embedding.is_empty() {
            return Err(SyncError::ProviderRejected(format!(
                "no embedding for face {}",
                face.face_id
            )));
        }

        let mut vector = embedded.embedding;
        l2_normalize(&mut vector);
        self.catalog
            .upsert_embedding(&StoredEmbedding {
                face_id: face.face_id,
                person_id,
                vector,
                model: embedded.model.unwrap_or_else(|| self.config.model.clone()),
            })
            .await?;
        Ok(format!("{}{}", EXTERNAL_PREFIX, face.face_id))
    }
}

/// Best similarity per person, highest first, cut to `top_k` then `threshold`.
fn rank_persons(
    query: &[f32],
    embeddings: &[StoredEmbedding],
    top_k: usize,
    threshold: f32,
) -> Vec<(PersonId, f32)> {
    let mut best: HashMap<PersonId, f32> = HashMap::new();
    for stored in embeddings {
        let score = cosine_similarity(query, &stored.vector);
        best.entry(stored.person_id)
            .and_modify(|b| *b = b.max(score))
            .or_insert(score);
    }

    let mut ranked: Vec<(PersonId, f32)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(top_k);
    ranked.retain(|(_, score)| *score >= threshold);
    ranked
}

#[async_trait]
impl<C: CatalogStore> FaceProvider for LocalFaceProvider<C> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            identify_by_id: false,
            search_by_image: true,
        }
    }

    /// Cosine similarities of the same person rarely reach the sync default
    fn confidence_threshold(&self) -> Option<f32> {
        Some(self.config.face_match_threshold)
    }

    async fn ensure_ready(&self) -> SyncResult<()> {
        self.client.health().await?;
        info!("InsightFace service reachable at {}", self.config.base_url);
        Ok(())
    }

    async fn upsert_persons(
        &self,
        persons: &[PersonSyncItem],
    ) -> SyncResult<HashMap<PersonId, String>> {
        Ok(persons
            .iter()
            .map(|p| (p.person_id, format!("{}{}", EXTERNAL_PREFIX, p.person_id)))
            .collect())
    }

    async fn link_faces_to_person(
        &self,
        person_id: PersonId,
        _person_external_id: &str,
        faces: &[FaceToLink],
    ) -> SyncResult<HashMap<FaceId, String>> {
        let enrollments: Vec<_> = faces
            .iter()
            .map(|face| async move { (face.face_id, self.enroll(person_id, face).await) })
            .collect();
        let outcomes: Vec<(FaceId, SyncResult<String>)> = stream::iter(enrollments)
            .buffer_unordered(self.config.max_parallelism.max(1))
            .collect()
            .await;

        let mut linked = HashMap::with_capacity(faces.len());
        for (face_id, outcome) in outcomes {
            match outcome {
                Ok(external) => {
                    linked.insert(face_id, external);
                }
                Err(SyncError::ProviderRejected(reason)) => {
                    warn!("Could not embed face {} (person {}): {}", face_id, person_id, reason);
                }
                Err(err) => return Err(err),
            }
        }
        debug!("Embedded {} of {} faces for person {}", linked.len(), faces.len(), person_id);
        Ok(linked)
    }

    async fn detect(&self, image: &[u8]) -> SyncResult<Vec<DetectedFace>> {
        let detected = self.client.detect(image).await?;
        Ok(detected
            .faces
            .into_iter()
            .map(|f| DetectedFace {
                provider_face_id: f.id.unwrap_or_default(),
                confidence: f.score,
                age: f.age,
                gender: f.gender,
            })
            .collect())
    }

    async fn identify(&self, _provider_face_ids: &[String]) -> SyncResult<Vec<IdentifyResult>> {
        Ok(Vec::new())
    }

    async fn search_users_by_image(&self, image: &[u8]) -> SyncResult<Vec<UserMatch>> {
        let embedded = self.client.embed(image).await?;
        let mut query = embedded.embedding;
        l2_normalize(&mut query);

        let embeddings = self.catalog.all_embeddings().await?;
        Ok(rank_persons(
            &query,
            &embeddings,
            self.config.top_k,
            self.config.face_match_threshold,
        )
        .into_iter()
        .map(|(person_id, score)| UserMatch {
            provider_person_id: format!("{}{}", EXTERNAL_PREFIX, person_id),
            confidence: score,
        })
        .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::test_catalog;
    use bytes::Bytes;
    use mockito::Matcher;

    /// Embeds by reading the first two bytes as a 2-d vector; `0xFF` means "no face".
    struct ByteEmbedder;

    #[async_trait]
    impl InsightFaceClient for ByteEmbedder {
        async fn health(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn detect(&self, _image: &[u8]) -> SyncResult<LocalDetectResponse> {
            Ok(LocalDetectResponse {
                faces: vec![LocalDetectedFace {
                    id: Some("0".to_string()),
                    score: Some(0.99),
                    age: None,
                    gender: None,
                }],
            })
        }

        async fn embed(&self, image: &[u8]) -> SyncResult<LocalEmbedResponse> {
            if image.first() == Some(&0xFF) {
                return Err(SyncError::ProviderRejected("no face".to_string()));
            }
            Ok(LocalEmbedResponse {
                embedding: vec![image[0] as f32, image[1] as f32],
                model: None,
            })
        }
    }

    fn config() -> LocalConfig {
        LocalConfig {
            top_k: 2,
            face_match_threshold: 0.9,
            ..LocalConfig::default()
        }
    }

    fn stored(face_id: FaceId, person_id: PersonId, vector: Vec<f32>) -> StoredEmbedding {
        StoredEmbedding {
            face_id,
            person_id,
            vector,
            model: "test".to_string(),
        }
    }

    #[test]
    fn test_rank_takes_best_score_per_person() {
        let embeddings = vec![
            stored(1, 7, vec![0.0, 1.0]),
            stored(2, 7, vec![1.0, 0.0]),
            stored(3, 8, vec![0.6, 0.8]),
            stored(4, 9, vec![-1.0, 0.0]),
        ];

        let ranked = rank_persons(&[1.0, 0.0], &embeddings, 5, 0.5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 7);
        assert!((ranked[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(ranked[1].0, 8);
    }

    #[test]
    fn test_rank_applies_top_k_before_threshold() {
        let embeddings = vec![stored(1, 1, vec![1.0, 0.0]), stored(2, 2, vec![1.0, 0.01])];
        let ranked = rank_persons(&[1.0, 0.0], &embeddings, 1, 0.0);
        assert_eq!(ranked, vec![(1, 1.0)]);
    }

    #[tokio::test]
    async fn test_link_stores_normalized_embeddings_and_skips_refused() {
        let (_dir, catalog) = test_catalog().await;
        let provider = LocalFaceProvider::with_client(config(), catalog.clone(), Arc::new(ByteEmbedder));

        let faces = vec![
            FaceToLink { face_id: 1, image: Bytes::from_static(&[3, 4]), external_id: None },
            FaceToLink { face_id: 2, image: Bytes::from_static(&[0xFF, 0]), external_id: None },
        ];
        let linked = provider.link_faces_to_person(5, "local:5", &faces).await.unwrap();

        assert_eq!(linked.len(), 1);
        assert_eq!(linked[&1], "local:1");

        let all = catalog.all_embeddings().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].person_id, 5);
        assert!((all[0].vector[0] - 0.6).abs() < 1e-6);
        assert_eq!(all[0].model, "buffalo_l");
    }

    #[tokio::test]
    async fn test_search_matches_enrolled_person() {
        let (_dir, catalog) = test_catalog().await;
        let provider = LocalFaceProvider::with_client(config(), catalog.clone(), Arc::new(ByteEmbedder));

        let faces = vec![FaceToLink { face_id: 1, image: Bytes::from_static(&[3, 4]), external_id: None }];
        provider.link_faces_to_person(5, "local:5", &faces).await.unwrap();

        let matches = provider.search_users_by_image(&[6, 8]).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].provider_person_id, "local:5");

        let none = provider.search_users_by_image(&[8, 0]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_match_threshold_is_the_assignment_threshold() {
        let (_dir, catalog) = test_catalog().await;
        let provider = LocalFaceProvider::with_client(
            LocalConfig::default(),
            catalog,
            Arc::new(ByteEmbedder),
        );
        assert_eq!(provider.confidence_threshold(), Some(0.45));
    }

    #[tokio::test]
    async fn test_http_client_parses_embedding() {
        let mut server = mockito::Server::new_async().await;
        let embed = server
            .mock("POST", "/embed")
            .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
            .match_body(Matcher::Regex(r#"name="file"; filename="face.jpg""#.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding": [0.1, 0.2, 0.3], "model": "buffalo_s"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpInsightFaceClient::new(&format!("{}/", server.url())).unwrap();
        let embedded = client.embed(b"jpeg").await.unwrap();

        embed.assert_async().await;
        assert_eq!(embedded.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(embedded.model.as_deref(), Some("buffalo_s"));
    }

    #[tokio::test]
    async fn test_http_client_parses_detections() {
        let mut server = mockito::Server::new_async().await;
        let _detect = server
            .mock("POST", "/detect")
            .match_body(Matcher::Regex(r#"filename="photo.jpg""#.into()))
            .with_status(200)
            .with_body(r#"{"faces": [{"id": "0", "score": 0.97, "age": 31.0, "gender": "F"}, {}]}"#)
            .create_async()
            .await;

        let client = HttpInsightFaceClient::new(&server.url()).unwrap();
        let detected = client.detect(b"jpeg").await.unwrap();

        assert_eq!(detected.faces.len(), 2);
        assert_eq!(detected.faces[0].id.as_deref(), Some("0"));
        assert_eq!(detected.faces[0].gender.as_deref(), Some("F"));
        assert!(detected.faces[1].score.is_none());
    }

    #[tokio::test]
    async fn test_http_client_health_and_refusals() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(400)
            .with_body("model loading")
            .create_async()
            .await;
        let _embed = server
            .mock("POST", "/embed")
            .with_status(422)
            .with_body("no face detected")
            .create_async()
            .await;

        let client = HttpInsightFaceClient::new(&server.url()).unwrap();

        let err = client.health().await.unwrap_err();
        assert!(matches!(err, SyncError::ProviderUnavailable { .. }));
        let err = client.embed(b"jpeg").await.unwrap_err();
        assert!(matches!(err, SyncError::ProviderRejected(_)));
    }

    #[tokio::test]
    async fn test_upsert_is_deterministic() {
        let (_dir, catalog) = test_catalog().await;
        let provider = LocalFaceProvider::with_client(config(), catalog, Arc::new(ByteEmbedder));
        let items = vec![PersonSyncItem { person_id: 5, name: "Alice".to_string(), external_id: None }];

        let first = provider.upsert_persons(&items).await.unwrap();
        let second = provider.upsert_persons(&items).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[&5], "local:5");
    }
}
