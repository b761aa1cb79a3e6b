//! Face synchronization engine
//!
//! Pushes local persons and enrolled faces to the active provider and pulls
//! identification results back. Phases run in order (faces need provider
//! person ids first); items inside a phase run concurrently up to the batch
//! size. A failing item never aborts its siblings; an unreachable backend
//! aborts the rest of the phase and leaves committed items in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::retry::RetryPolicy;
use crate::blob::{keys, ObjectStore};
use crate::catalog::FaceCatalogService;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceRecord, PersonId};
use crate::provider::{FaceProvider, FaceToLink, IdentifyCandidate, PersonSyncItem};
use crate::storage::CatalogStore;
use crate::summary::BatchSummary;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub persons: BatchSummary,
    pub faces: BatchSummary,
    pub identify: BatchSummary,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.persons.is_clean() && self.faces.is_clean() && self.identify.is_clean()
    }
}

pub struct FaceSyncEngine<C: CatalogStore> {
    faces: Arc<FaceCatalogService<C>>,
    provider: Arc<dyn FaceProvider>,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    confidence_threshold: f32,
    batch_size: usize,
}

impl<C: CatalogStore> FaceSyncEngine<C> {
    pub fn new(
        faces: Arc<FaceCatalogService<C>>,
        provider: Arc<dyn FaceProvider>,
        store: Arc<dyn ObjectStore>,
        config: &SyncConfig,
    ) -> Self {
        let confidence_threshold = provider
            .confidence_threshold()
            .unwrap_or(config.confidence_threshold);
        Self {
            faces,
            provider,
            store,
            retry: RetryPolicy::from(&config.retry),
            confidence_threshold,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn catalog(&self) -> &Arc<C> {
        self.faces.catalog()
    }

    fn provider_name(&self) -> &'static str {
        self.provider.kind().as_str()
    }

    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> SyncResult<()> {
        self.retry
            .run("ensure ready", cancel, || self.provider.ensure_ready())
            .await
    }

    /// One full pass: readiness check, persons, face enrollment, identification.
    pub async fn run_once(&self, full: bool, cancel: &CancellationToken) -> SyncResult<SyncReport> {
        self.ensure_ready(cancel).await?;

        let mut report = SyncReport {
            persons: self.sync_persons(full, cancel).await,
            faces: skipped("sync faces"),
            identify: skipped("identify"),
        };
        if cancel.is_cancelled() {
            return Ok(report);
        }

        report.faces = self.sync_faces_to_persons(cancel).await;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        report.identify = self.identify_unresolved(cancel).await;

        info!(
            "Sync pass with {}: persons {}/{} faces {}/{} identified {}/{}",
            self.provider_name(),
            report.persons.succeeded,
            report.persons.failed,
            report.faces.succeeded,
            report.faces.failed,
            report.identify.succeeded,
            report.identify.failed,
        );
        Ok(report)
    }

    /// Upsert persons lacking a provider id (or all of them when `full`) and
    /// store the ids the provider hands back.
    pub async fn sync_persons(&self, full: bool, cancel: &CancellationToken) -> BatchSummary {
        let mut summary = BatchSummary::new("sync persons");
        let provider = self.provider_name();

        let persons = match self.catalog().persons_for_sync(provider, full).await {
            Ok(persons) => persons,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        let items: Vec<PersonSyncItem> = persons
            .into_iter()
            .map(|p| PersonSyncItem {
                person_id: p.id,
                name: p.name,
                external_id: p.external_id,
            })
            .collect();

        for chunk in items.chunks(self.batch_size) {
            let upserted = self
                .retry
                .run("upsert persons", cancel, || self.provider.upsert_persons(chunk))
                .await;

            let map = match upserted {
                Ok(map) => map,
                Err(SyncError::Cancelled) => {
                    summary.abort("cancelled");
                    break;
                }
                Err(err) => {
                    for item in chunk {
                        summary.record_failure(item.person_id, &err);
                    }
                    if err.is_infrastructure() {
                        summary.abort(err.to_string());
                        break;
                    }
                    continue;
                }
            };

            for item in chunk {
                let Some(external) = map.get(&item.person_id) else {
                    summary.record_deferred(item.person_id);
                    continue;
                };
                match self
                    .catalog()
                    .set_person_external_id(item.person_id, external, provider)
                    .await
                {
                    Ok(()) => summary.record_success(),
                    Err(err) => summary.record_failure(item.person_id, &err),
                }
            }
        }

        info!(
            "Synced {} persons to {} ({} failed)",
            summary.succeeded, provider, summary.failed
        );
        summary
    }

    /// Enroll identified faces under their person's provider id. Faces the
    /// provider leaves out stay pending for the next run.
    pub async fn sync_faces_to_persons(&self, cancel: &CancellationToken) -> BatchSummary {
        let mut summary = BatchSummary::new("sync faces");
        let provider = self.provider_name();

        let pending = match self.catalog().faces_pending_enrollment(provider).await {
            Ok(faces) => faces,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        let persons = match self.catalog().list_persons().await {
            Ok(persons) => persons,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        let external_ids: HashMap<PersonId, String> = persons
            .into_iter()
            .filter(|p| p.provider.as_deref() == Some(provider))
            .filter_map(|p| p.external_id.map(|e| (p.id, e)))
            .collect();

        let mut groups: BTreeMap<PersonId, Vec<FaceRecord>> = BTreeMap::new();
        for face in pending {
            if let Some(person_id) = face.person_id {
                groups.entry(person_id).or_default().push(face);
            }
        }

        let mut work = Vec::with_capacity(groups.len());
        for (person_id, faces) in groups {
            match external_ids.get(&person_id) {
                Some(external) => work.push((person_id, external.clone(), faces)),
                None => {
                    debug!(
                        "Person {} has no {} id yet, deferring {} faces",
                        person_id,
                        provider,
                        faces.len()
                    );
                    for face in faces {
                        summary.record_deferred(face.id);
                    }
                }
            }
        }

        let batch = cancel.child_token();
        let mut linked = stream::iter(work)
            .map(|(person_id, external, faces)| {
                let batch = &batch;
                async move { self.link_person_faces(person_id, &external, faces, batch).await }
            })
            .buffer_unordered(self.batch_size);
        while let Some(group) = linked.next().await {
            summary.merge(group);
        }

        if cancel.is_cancelled() {
            summary.abort("cancelled");
        }
        info!(
            "Enrolled {} faces with {} ({} failed, {} pending)",
            summary.succeeded,
            provider,
            summary.failed,
            summary.deferred.len()
        );
        summary
    }

    async fn link_person_faces(
        &self,
        person_id: PersonId,
        external: &str,
        faces: Vec<FaceRecord>,
        batch: &CancellationToken,
    ) -> BatchSummary {
        let mut summary = BatchSummary::new("sync faces");
        let provider = self.provider_name();

        let mut to_link = Vec::with_capacity(faces.len());
        for face in faces {
            let Some(image) = &face.image else {
                summary.record_deferred(face.id);
                continue;
            };
            let loaded = tokio::select! {
                biased;
                _ = batch.cancelled() => return summary,
                loaded = self.store.get(&image.key) => loaded,
            };
            match loaded {
                Ok(bytes) => to_link.push(FaceToLink {
                    face_id: face.id,
                    image: bytes,
                    external_id: face
                        .external_face_id
                        .clone()
                        .filter(|_| face.provider.as_deref() == Some(provider)),
                }),
                Err(err) => {
                    summary.record_failure(face.id, &err);
                    if err.is_infrastructure() {
                        summary.abort(err.to_string());
                        batch.cancel();
                        return summary;
                    }
                }
            }
        }
        if to_link.is_empty() {
            return summary;
        }

        let linked = self
            .retry
            .run("link faces", batch, || {
                self.provider.link_faces_to_person(person_id, external, &to_link)
            })
            .await;

        match linked {
            Ok(map) => {
                for face in &to_link {
                    let Some(provider_face_id) = map.get(&face.face_id) else {
                        summary.record_deferred(face.face_id);
                        continue;
                    };
                    match self
                        .catalog()
                        .set_face_enrollment(face.face_id, provider_face_id, provider)
                        .await
                    {
                        Ok(()) => summary.record_success(),
                        Err(err) => summary.record_failure(face.face_id, &err),
                    }
                }
            }
            Err(SyncError::Cancelled) => {}
            Err(err) => {
                for face in &to_link {
                    summary.record_failure(face.face_id, &err);
                }
                if err.is_infrastructure() {
                    summary.abort(err.to_string());
                    batch.cancel();
                }
            }
        }
        summary
    }

    /// Resolve unresolved faces against the provider. Confident matches are
    /// recorded through the catalog service; the rest stay unresolved.
    pub async fn identify_unresolved(&self, cancel: &CancellationToken) -> BatchSummary {
        let mut summary = BatchSummary::new("identify");
        let provider = self.provider_name();

        let faces = match self.catalog().unresolved_faces().await {
            Ok(faces) => faces,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        let persons = match self.catalog().list_persons().await {
            Ok(persons) => persons,
            Err(err) => {
                summary.abort(err.to_string());
                return summary;
            }
        };
        let lookup: HashMap<String, PersonId> = persons
            .into_iter()
            .filter(|p| p.provider.as_deref() == Some(provider))
            .filter_map(|p| p.external_id.map(|e| (e, p.id)))
            .collect();

        let batch = cancel.child_token();
        let mut outcomes = stream::iter(faces)
            .map(|face| {
                let lookup = &lookup;
                let batch = &batch;
                async move { (face.id, self.identify_face(&face, lookup, batch).await) }
            })
            .buffer_unordered(self.batch_size);

        while let Some((face_id, outcome)) = outcomes.next().await {
            match outcome {
                Ok(Some((person_id, confidence))) => match self
                    .faces
                    .record_identification(face_id, person_id, confidence as f64)
                    .await
                {
                    Ok(true) => summary.record_success(),
                    Ok(false) => debug!("Face {} changed while identifying, skipped", face_id),
                    Err(err) => summary.record_failure(face_id, &err),
                },
                Ok(None) => summary.record_deferred(face_id),
                Err(SyncError::Cancelled) => {}
                Err(err) => {
                    summary.record_failure(face_id, &err);
                    if err.is_infrastructure() {
                        summary.abort(err.to_string());
                        batch.cancel();
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            summary.abort("cancelled");
        }
        info!(
            "Identified {} faces with {} ({} failed, {} unmatched)",
            summary.succeeded,
            provider,
            summary.failed,
            summary.deferred.len()
        );
        summary
    }

    /// Id-based identify when the provider supports it, image search whenever
    /// that produced no candidates.
    async fn identify_face(
        &self,
        face: &FaceRecord,
        lookup: &HashMap<String, PersonId>,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<(PersonId, f32)>> {
        let key = face
            .image
            .as_ref()
            .map(|b| b.key.clone())
            .ok_or_else(|| SyncError::StorageIntegrity {
                key: keys::face_key(face.id),
                reason: "face has no stored image".to_string(),
            })?;
        let image = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            loaded = self.store.get(&key) => loaded,
        }?;

        let mut candidates: Vec<IdentifyCandidate> = Vec::new();

        if self.provider.capabilities().identify_by_id {
            let enrolled = face
                .external_face_id
                .clone()
                .filter(|_| face.provider.as_deref() == Some(self.provider_name()));
            let face_ids: Vec<String> = match enrolled {
                Some(id) => vec![id],
                None => self
                    .retry
                    .run("detect", cancel, || self.provider.detect(&image))
                    .await?
                    .into_iter()
                    .map(|d| d.provider_face_id)
                    .filter(|id| !id.is_empty())
                    .collect(),
            };

            if !face_ids.is_empty() {
                candidates = self
                    .retry
                    .run("identify", cancel, || self.provider.identify(&face_ids))
                    .await?
                    .into_iter()
                    .flat_map(|r| r.candidates)
                    .collect();
            }
        }

        if candidates.is_empty() {
            candidates = self
                .retry
                .run("search users", cancel, || {
                    self.provider.search_users_by_image(&image)
                })
                .await?
                .into_iter()
                .map(|m| IdentifyCandidate {
                    provider_person_id: m.provider_person_id,
                    confidence: m.confidence,
                })
                .collect();
        }

        Ok(best_match(&candidates, lookup, self.confidence_threshold))
    }
}

fn skipped(operation: &str) -> BatchSummary {
    let mut summary = BatchSummary::new(operation);
    summary.abort("cancelled");
    summary
}

/// Highest-confidence candidate at or above `threshold` that maps to a local person
fn best_match(
    candidates: &[IdentifyCandidate],
    lookup: &HashMap<String, PersonId>,
    threshold: f32,
) -> Option<(PersonId, f32)> {
    candidates
        .iter()
        .filter(|c| c.confidence >= threshold)
        .filter_map(|c| {
            lookup
                .get(&c.provider_person_id)
                .map(|person_id| (*person_id, c.confidence))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryObjectStore;
    use crate::catalog::MediaUrlResolver;
    use crate::model::{BlobCoordinates, FaceAssignment, FaceId, IdentityStatus};
    use crate::provider::{
        DetectedFace, IdentifyResult, ProviderCapabilities, ProviderKind, UserMatch,
    };
    use crate::storage::sqlite::tests::test_catalog;
    use crate::storage::SqliteCatalog;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct StubProvider {
        identify_by_id: bool,
        detected_ids: Vec<String>,
        identify_candidates: Vec<IdentifyCandidate>,
        search_matches: Vec<UserMatch>,
        skip_faces: HashSet<FaceId>,
        rejected_persons: HashSet<PersonId>,
        unavailable: bool,
        threshold: Option<f32>,
        calls: Mutex<Vec<String>>,
    }

    impl StubProvider {
        fn log(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn check(&self) -> SyncResult<()> {
            if self.unavailable {
                return Err(SyncError::provider_unavailable("stub offline"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FaceProvider for StubProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Azure
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                identify_by_id: self.identify_by_id,
                search_by_image: true,
            }
        }

        fn confidence_threshold(&self) -> Option<f32> {
            self.threshold
        }

        async fn ensure_ready(&self) -> SyncResult<()> {
            self.check()
        }

        async fn upsert_persons(
            &self,
            persons: &[PersonSyncItem],
        ) -> SyncResult<HashMap<PersonId, String>> {
            self.check()?;
            self.log(format!("upsert {}", persons.len()));
            Ok(persons
                .iter()
                .map(|p| (p.person_id, format!("ext-{}", p.person_id)))
                .collect())
        }

        async fn link_faces_to_person(
            &self,
            person_id: PersonId,
            _person_external_id: &str,
            faces: &[FaceToLink],
        ) -> SyncResult<HashMap<FaceId, String>> {
            self.check()?;
            for face in faces {
                self.log(format!("link {}", face.face_id));
            }
            if self.rejected_persons.contains(&person_id) {
                return Err(SyncError::ProviderRejected("bad person".into()));
            }
            Ok(faces
                .iter()
                .filter(|f| !self.skip_faces.contains(&f.face_id))
                .map(|f| (f.face_id, format!("pf-{}", f.face_id)))
                .collect())
        }

        async fn detect(&self, _image: &[u8]) -> SyncResult<Vec<DetectedFace>> {
            self.log("detect".to_string());
            Ok(self
                .detected_ids
                .iter()
                .map(|id| DetectedFace {
                    provider_face_id: id.clone(),
                    confidence: None,
                    age: None,
                    gender: None,
                })
                .collect())
        }

        async fn identify(&self, provider_face_ids: &[String]) -> SyncResult<Vec<IdentifyResult>> {
            self.log("identify".to_string());
            if !self.identify_by_id {
                return Ok(Vec::new());
            }
            Ok(provider_face_ids
                .iter()
                .map(|id| IdentifyResult {
                    provider_face_id: id.clone(),
                    candidates: self.identify_candidates.clone(),
                })
                .collect())
        }

        async fn search_users_by_image(&self, _image: &[u8]) -> SyncResult<Vec<UserMatch>> {
            self.check()?;
            self.log("search".to_string());
            Ok(self.search_matches.clone())
        }
    }

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<SqliteCatalog>,
        store: Arc<MemoryObjectStore>,
        faces: Arc<FaceCatalogService<SqliteCatalog>>,
    }

    impl Fixture {
        async fn new() -> Self {
            let (dir, catalog) = test_catalog().await;
            catalog.insert_photo(1, "main", None).await.unwrap();
            let store = Arc::new(MemoryObjectStore::new());
            let urls = MediaUrlResolver::new(store.clone(), Duration::from_secs(60));
            let faces = Arc::new(FaceCatalogService::new(catalog.clone(), urls));
            Self {
                _dir: dir,
                catalog,
                store,
                faces,
            }
        }

        async fn face_with_image(&self, face_id: FaceId) {
            let key = keys::face_key(face_id);
            self.catalog.insert_face(face_id, 1).await.unwrap();
            self.store.insert(&key, vec![face_id as u8; 4]);
            self.catalog
                .set_face_blob(
                    face_id,
                    &BlobCoordinates {
                        key,
                        sha256: "00".repeat(32),
                        etag: "\"e\"".to_string(),
                        size: 4,
                    },
                )
                .await
                .unwrap();
        }

        async fn person(&self, person_id: PersonId, external: Option<&str>) {
            self.catalog.insert_person(person_id, "Someone").await.unwrap();
            if let Some(external) = external {
                self.catalog
                    .set_person_external_id(person_id, external, "azure")
                    .await
                    .unwrap();
            }
        }

        fn engine(&self, provider: Arc<StubProvider>) -> FaceSyncEngine<SqliteCatalog> {
            let config = SyncConfig {
                batch_size: 4,
                ..SyncConfig::default()
            };
            FaceSyncEngine::new(self.faces.clone(), provider, self.store.clone(), &config)
                .with_retry(RetryPolicy::none())
        }
    }

    #[tokio::test]
    async fn test_upserted_external_id_is_persisted() {
        let fx = Fixture::new().await;
        fx.catalog.insert_person(5, "Alice").await.unwrap();
        let engine = fx.engine(Arc::new(StubProvider::default()));

        let summary = engine.sync_persons(false, &CancellationToken::new()).await;
        assert_eq!(summary.succeeded, 1);

        let person = fx.catalog.get_person(5).await.unwrap().unwrap();
        assert_eq!(person.external_id.as_deref(), Some("ext-5"));
        assert_eq!(person.provider.as_deref(), Some("azure"));

        // already synced persons are not sent again unless a full resync is requested
        let provider = Arc::new(StubProvider::default());
        let engine = fx.engine(provider.clone());
        assert_eq!(engine.sync_persons(false, &CancellationToken::new()).await.succeeded, 0);
        assert_eq!(engine.sync_persons(true, &CancellationToken::new()).await.succeeded, 1);
        assert_eq!(provider.calls(), vec!["upsert 1"]);
    }

    #[tokio::test]
    async fn test_omitted_face_stays_pending_for_retry() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        for face_id in 1..=3 {
            fx.face_with_image(face_id).await;
            fx.faces.update_face(face_id, FaceAssignment::Assigned(5)).await.unwrap();
        }

        let provider = Arc::new(StubProvider {
            skip_faces: HashSet::from([3]),
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider)
            .sync_faces_to_persons(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.deferred, vec!["3".to_string()]);

        let third = fx.catalog.get_face(3).await.unwrap().unwrap();
        assert_eq!(third.external_face_id, None);
        assert_eq!(third.identity_status, IdentityStatus::Identified);
        assert_eq!(
            fx.catalog.get_face(1).await.unwrap().unwrap().external_face_id.as_deref(),
            Some("pf-1")
        );

        let retry = Arc::new(StubProvider::default());
        let summary = fx
            .engine(retry.clone())
            .sync_faces_to_persons(&CancellationToken::new())
            .await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(retry.calls(), vec!["link 3"]);
    }

    #[tokio::test]
    async fn test_rejected_person_does_not_abort_others() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.person(6, Some("ext-6")).await;
        fx.face_with_image(1).await;
        fx.face_with_image(2).await;
        fx.faces.update_face(1, FaceAssignment::Assigned(5)).await.unwrap();
        fx.faces.update_face(2, FaceAssignment::Assigned(6)).await.unwrap();

        let provider = Arc::new(StubProvider {
            rejected_persons: HashSet::from([6]),
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider)
            .sync_faces_to_persons(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed_ids(), vec!["2"]);
        assert!(!summary.failures[0].retryable);
        assert!(summary.aborted.is_none());
    }

    #[tokio::test]
    async fn test_missing_blob_fails_only_that_face() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;
        fx.face_with_image(2).await;
        fx.faces.update_face(1, FaceAssignment::Assigned(5)).await.unwrap();
        fx.faces.update_face(2, FaceAssignment::Assigned(5)).await.unwrap();
        fx.store.delete(&keys::face_key(2)).await.unwrap();

        let summary = fx
            .engine(Arc::new(StubProvider::default()))
            .sync_faces_to_persons(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed_ids(), vec!["2"]);
        assert!(summary.failures[0].retryable);
    }

    #[tokio::test]
    async fn test_person_without_external_id_is_deferred() {
        let fx = Fixture::new().await;
        fx.person(5, None).await;
        fx.face_with_image(1).await;
        fx.faces.update_face(1, FaceAssignment::Assigned(5)).await.unwrap();

        let provider = Arc::new(StubProvider::default());
        let summary = fx
            .engine(provider.clone())
            .sync_faces_to_persons(&CancellationToken::new())
            .await;

        assert_eq!(summary.deferred, vec!["1".to_string()]);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_identify_falls_back_to_search() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;
        assert!(fx.faces.persons().await.unwrap().is_empty());

        let provider = Arc::new(StubProvider {
            identify_by_id: true,
            detected_ids: vec!["d-1".to_string()],
            search_matches: vec![UserMatch {
                provider_person_id: "ext-5".to_string(),
                confidence: 0.95,
            }],
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider.clone())
            .identify_unresolved(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(provider.calls(), vec!["detect", "identify", "search"]);

        let face = fx.catalog.get_face(1).await.unwrap().unwrap();
        assert_eq!(face.person_id, Some(5));
        assert_eq!(face.identity_status, IdentityStatus::Identified);
        assert!((face.confidence - 0.95).abs() < 1e-6);
        assert_eq!(fx.faces.persons().await.unwrap()[0].id, 5);
    }

    #[tokio::test]
    async fn test_identify_candidate_skips_search() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;

        let provider = Arc::new(StubProvider {
            identify_by_id: true,
            detected_ids: vec!["d-1".to_string()],
            identify_candidates: vec![
                IdentifyCandidate {
                    provider_person_id: "unknown".to_string(),
                    confidence: 0.99,
                },
                IdentifyCandidate {
                    provider_person_id: "ext-5".to_string(),
                    confidence: 0.85,
                },
            ],
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider.clone())
            .identify_unresolved(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 1);
        assert!(!provider.calls().contains(&"search".to_string()));
        assert_eq!(fx.catalog.get_face(1).await.unwrap().unwrap().person_id, Some(5));
    }

    #[tokio::test]
    async fn test_provider_threshold_replaces_sync_threshold() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;

        let provider = Arc::new(StubProvider {
            search_matches: vec![UserMatch {
                provider_person_id: "ext-5".to_string(),
                confidence: 0.5,
            }],
            threshold: Some(0.45),
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider)
            .identify_unresolved(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 1);
        let face = fx.catalog.get_face(1).await.unwrap().unwrap();
        assert_eq!(face.person_id, Some(5));
        assert_eq!(face.identity_status, IdentityStatus::Identified);
    }

    #[tokio::test]
    async fn test_low_confidence_leaves_face_unresolved() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;

        let provider = Arc::new(StubProvider {
            search_matches: vec![UserMatch {
                provider_person_id: "ext-5".to_string(),
                confidence: 0.5,
            }],
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider.clone())
            .identify_unresolved(&CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.deferred, vec!["1".to_string()]);
        assert_eq!(provider.calls(), vec!["search"]);
        let face = fx.catalog.get_face(1).await.unwrap().unwrap();
        assert_eq!(face.identity_status, IdentityStatus::Unresolved);
    }

    #[tokio::test]
    async fn test_unreachable_provider_aborts_batch() {
        let fx = Fixture::new().await;
        fx.person(5, Some("ext-5")).await;
        fx.face_with_image(1).await;
        fx.face_with_image(2).await;

        let provider = Arc::new(StubProvider {
            unavailable: true,
            ..StubProvider::default()
        });
        let summary = fx
            .engine(provider)
            .identify_unresolved(&CancellationToken::new())
            .await;

        assert!(summary.aborted.is_some());
        assert!(summary.failed >= 1);
        assert!(summary.failures.iter().all(|f| f.retryable));
    }

    #[tokio::test]
    async fn test_run_once_fails_fast_when_not_ready() {
        let fx = Fixture::new().await;
        let provider = Arc::new(StubProvider {
            unavailable: true,
            ..StubProvider::default()
        });

        let err = fx
            .engine(provider)
            .run_once(false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_run_once_end_to_end() {
        let fx = Fixture::new().await;
        fx.catalog.insert_person(5, "Alice").await.unwrap();
        fx.face_with_image(1).await;
        fx.face_with_image(2).await;
        fx.faces.update_face(1, FaceAssignment::Assigned(5)).await.unwrap();

        let provider = Arc::new(StubProvider {
            search_matches: vec![UserMatch {
                provider_person_id: "ext-5".to_string(),
                confidence: 0.9,
            }],
            ..StubProvider::default()
        });
        let report = fx
            .engine(provider)
            .run_once(false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(report.persons.succeeded, 1);
        assert_eq!(report.faces.succeeded, 1);
        assert_eq!(report.identify.succeeded, 1);
        assert_eq!(fx.catalog.get_face(2).await.unwrap().unwrap().person_id, Some(5));
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_partial_completion() {
        let fx = Fixture::new().await;
        fx.catalog.insert_person(5, "Alice").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .engine(Arc::new(StubProvider::default()))
            .run_once(false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));

        let summary = fx
            .engine(Arc::new(StubProvider::default()))
            .sync_persons(false, &cancel)
            .await;
        assert_eq!(summary.aborted.as_deref(), Some("cancelled"));
        assert_eq!(summary.succeeded, 0);
        assert!(fx.catalog.get_person(5).await.unwrap().unwrap().external_id.is_none());
    }

    #[test]
    fn test_best_match_respects_threshold_and_lookup() {
        let lookup = HashMap::from([("a".to_string(), 1), ("b".to_string(), 2)]);
        let candidates = vec![
            IdentifyCandidate { provider_person_id: "a".to_string(), confidence: 0.81 },
            IdentifyCandidate { provider_person_id: "b".to_string(), confidence: 0.9 },
            IdentifyCandidate { provider_person_id: "c".to_string(), confidence: 0.99 },
        ];
        assert_eq!(best_match(&candidates, &lookup, 0.8), Some((2, 0.9)));
        assert_eq!(best_match(&candidates, &lookup, 0.95), None);
    }
}
