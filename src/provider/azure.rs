//! Azure Face provider (person groups over the REST API)
//!
//! Persons are matched to local persons through `userData`, which carries the
//! local person id. Enrollment adds persisted faces and retrains the group.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::http::{check, client, transport_error};
use super::{
    DetectedFace, FaceProvider, FaceToLink, IdentifyCandidate, IdentifyResult,
    PersonSyncItem, ProviderCapabilities, ProviderKind, UserMatch,
};
use crate::config::AzureConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{FaceId, PersonId};

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const PAGE_SIZE: usize = 1000;
const MAX_CANDIDATES: u32 = 5;
const TRAINING_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupPerson {
    person_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrolledPerson {
    #[serde(default)]
    persisted_face_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPerson {
    person_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedFace {
    persisted_face_id: String,
}

#[derive(Debug, Deserialize)]
struct TrainingStatus {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Detected {
    #[serde(default)]
    face_id: Option<String>,
    #[serde(default)]
    face_attributes: Option<Attributes>,
}

#[derive(Debug, Deserialize)]
struct Attributes {
    #[serde(default)]
    age: Option<f32>,
    #[serde(default)]
    gender: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identified {
    face_id: String,
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    person_id: String,
    confidence: f32,
}

pub struct AzureFaceProvider {
    http: Client,
    config: AzureConfig,
    /// (Azure person, local face) -> persisted face id added by this process
    added: Mutex<HashMap<(String, FaceId), String>>,
}

impl AzureFaceProvider {
    pub fn new(config: AzureConfig) -> SyncResult<Self> {
        Ok(Self {
            http: client(Duration::from_secs(60))?,
            config,
            added: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/face/v1.0/{}",
            self.config.endpoint.trim_end_matches('/'),
            path
        )
    }

    fn group_url(&self, path: &str) -> String {
        if path.is_empty() {
            self.url(&format!("persongroups/{}", self.config.person_group_id))
        } else {
            self.url(&format!("persongroups/{}/{}", self.config.person_group_id, path))
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(KEY_HEADER, &self.config.key)
    }

    async fn list_persons(&self) -> SyncResult<Vec<GroupPerson>> {
        let mut all = Vec::new();
        let mut start: Option<String> = None;

        loop {
            let mut request = self
                .authed(self.http.get(self.group_url("persons")))
                .query(&[("top", PAGE_SIZE.to_string())]);
            if let Some(start) = &start {
                request = request.query(&[("start", start)]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| transport_error("list persons", e))?;
            let page: Vec<GroupPerson> = check("list persons", response)
                .await?
                .json()
                .await
                .map_err(|e| transport_error("list persons", e))?;

            let done = page.len() < PAGE_SIZE;
            start = page.last().map(|p| p.person_id.clone());
            all.extend(page);
            if done {
                break;
            }
        }

        Ok(all)
    }

    async fn create_person(&self, item: &PersonSyncItem) -> SyncResult<String> {
        let response = self
            .authed(self.http.post(self.group_url("persons")))
            .json(&json!({ "name": item.name, "userData": item.person_id.to_string() }))
            .send()
            .await
            .map_err(|e| transport_error("create person", e))?;
        let created: CreatedPerson = check("create person", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("create person", e))?;
        debug!("Created Azure person {} for person {}", created.person_id, item.person_id);
        Ok(created.person_id)
    }

    async fn rename_person(&self, azure_id: &str, name: &str) -> SyncResult<()> {
        let response = self
            .authed(self.http.patch(self.group_url(&format!("persons/{}", azure_id))))
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| transport_error("update person", e))?;
        check("update person", response).await?;
        Ok(())
    }

    async fn persisted_faces(&self, azure_person: &str) -> SyncResult<Vec<String>> {
        let response = self
            .authed(self.http.get(self.group_url(&format!("persons/{}", azure_person))))
            .send()
            .await
            .map_err(|e| transport_error("get person", e))?;
        let person: EnrolledPerson = check("get person", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("get person", e))?;
        Ok(person.persisted_face_ids)
    }

    /// Persisted id of a face the person already holds, from an earlier run or
    /// an earlier attempt of this one.
    fn already_enrolled(
        &self,
        azure_person: &str,
        face: &FaceToLink,
        persisted: &[String],
    ) -> Option<String> {
        let recent = self
            .added
            .lock()
            .get(&(azure_person.to_string(), face.face_id))
            .cloned();
        recent
            .into_iter()
            .chain(face.external_id.clone())
            .find(|id| persisted.contains(id))
    }

    async fn add_face(&self, azure_person: &str, face: &FaceToLink) -> SyncResult<String> {
        let response = self
            .authed(self.http.post(self.group_url(&format!(
                "persons/{}/persistedFaces",
                azure_person
            ))))
            .query(&[
                ("userData", face.face_id.to_string()),
                ("detectionModel", self.config.detection_model.clone()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(face.image.clone())
            .send()
            .await
            .map_err(|e| transport_error("add face", e))?;
        let added: PersistedFace = check("add face", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("add face", e))?;
        Ok(added.persisted_face_id)
    }

    async fn train(&self) -> SyncResult<bool> {
        let response = self
            .authed(self.http.post(self.group_url("train")))
            .send()
            .await
            .map_err(|e| transport_error("train", e))?;
        check("train", response).await?;

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.train_timeout_secs);
        loop {
            let response = self
                .authed(self.http.get(self.group_url("training")))
                .send()
                .await
                .map_err(|e| transport_error("training status", e))?;
            let status: TrainingStatus = check("training status", response)
                .await?
                .json()
                .await
                .map_err(|e| transport_error("training status", e))?;

            match status.status.as_str() {
                "succeeded" => return Ok(true),
                "failed" => {
                    error!(
                        "Azure training failed: {}",
                        status.message.unwrap_or_default()
                    );
                    return Ok(false);
                }
                _ => {}
            }

            if started.elapsed() > timeout {
                warn!("Azure training did not finish within {:?}", timeout);
                return Ok(false);
            }
            tokio::time::sleep(TRAINING_POLL).await;
        }
    }
}

/// Local person id -> Azure person for every group person whose userData is a local id
fn index_by_user_data(persons: &[GroupPerson]) -> HashMap<PersonId, &GroupPerson> {
    persons
        .iter()
        .filter_map(|p| {
            p.user_data
                .as_deref()
                .and_then(|u| u.parse::<PersonId>().ok())
                .map(|id| (id, p))
        })
        .collect()
}

fn to_results(identified: Vec<Identified>) -> Vec<IdentifyResult> {
    identified
        .into_iter()
        .map(|r| IdentifyResult {
            provider_face_id: r.face_id,
            candidates: r
                .candidates
                .into_iter()
                .map(|c| IdentifyCandidate {
                    provider_person_id: c.person_id,
                    confidence: c.confidence,
                })
                .collect(),
        })
        .collect()
}

#[async_trait]
impl FaceProvider for AzureFaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            identify_by_id: true,
            search_by_image: false,
        }
    }

    async fn ensure_ready(&self) -> SyncResult<()> {
        let response = self
            .authed(self.http.get(self.group_url("")))
            .send()
            .await
            .map_err(|e| transport_error("get person group", e))?;

        if response.status() != StatusCode::NOT_FOUND {
            check("get person group", response).await?;
            return Ok(());
        }

        let response = self
            .authed(self.http.put(self.group_url("")))
            .json(&json!({
                "name": self.config.person_group_id,
                "recognitionModel": self.config.recognition_model,
            }))
            .send()
            .await
            .map_err(|e| transport_error("create person group", e))?;
        check("create person group", response).await?;
        info!("Created Azure person group {}", self.config.person_group_id);
        Ok(())
    }

    async fn upsert_persons(
        &self,
        persons: &[PersonSyncItem],
    ) -> SyncResult<HashMap<PersonId, String>> {
        if persons.is_empty() {
            return Ok(HashMap::new());
        }

        let existing = self.list_persons().await?;
        let by_local = index_by_user_data(&existing);

        let mut map = HashMap::with_capacity(persons.len());
        for item in persons {
            let azure_id = match by_local.get(&item.person_id) {
                Some(person) => {
                    if person.name.as_deref() != Some(item.name.as_str()) {
                        match self.rename_person(&person.person_id, &item.name).await {
                            Ok(()) => {}
                            Err(SyncError::ProviderRejected(reason)) => warn!(
                                "Azure refused to rename person {}: {}",
                                item.person_id, reason
                            ),
                            Err(err) => return Err(err),
                        }
                    }
                    person.person_id.clone()
                }
                None => match self.create_person(item).await {
                    Ok(id) => id,
                    Err(SyncError::ProviderRejected(reason)) => {
                        warn!("Azure refused person {}: {}", item.person_id, reason);
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };
            map.insert(item.person_id, azure_id);
        }
        Ok(map)
    }

    async fn link_faces_to_person(
        &self,
        person_id: PersonId,
        person_external_id: &str,
        faces: &[FaceToLink],
    ) -> SyncResult<HashMap<FaceId, String>> {
        let persisted = self.persisted_faces(person_external_id).await?;

        let mut linked = HashMap::with_capacity(faces.len());
        let mut added = 0usize;
        for face in faces {
            if let Some(existing) = self.already_enrolled(person_external_id, face, &persisted) {
                debug!("Face {} already enrolled as {}", face.face_id, existing);
                linked.insert(face.face_id, existing);
                continue;
            }

            match self.add_face(person_external_id, face).await {
                Ok(persisted_id) => {
                    self.added
                        .lock()
                        .insert((person_external_id.to_string(), face.face_id), persisted_id.clone());
                    linked.insert(face.face_id, persisted_id);
                    added += 1;
                }
                Err(SyncError::ProviderRejected(reason)) => {
                    warn!(
                        "Azure refused face {} for person {}: {}",
                        face.face_id, person_id, reason
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if added > 0 {
            // the faces are persisted either way; the next enrollment retrains
            match self.train().await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Person group {} is not trained; identify results may lag",
                    self.config.person_group_id
                ),
                Err(err) => warn!(
                    "Training person group {} failed: {}",
                    self.config.person_group_id, err
                ),
            }
        }
        Ok(linked)
    }

    async fn detect(&self, image: &[u8]) -> SyncResult<Vec<DetectedFace>> {
        let mut query = vec![
            ("returnFaceId", "true".to_string()),
            ("recognitionModel", self.config.recognition_model.clone()),
            ("detectionModel", self.config.detection_model.clone()),
        ];
        // newer detection models reject attribute requests
        if self.config.detection_model.eq_ignore_ascii_case("detection_01") {
            query.push(("returnFaceAttributes", "age,gender".to_string()));
        }

        let response = self
            .authed(self.http.post(self.url("detect")))
            .query(&query)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| transport_error("detect", e))?;
        let detected: Vec<Detected> = check("detect", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("detect", e))?;

        Ok(detected
            .into_iter()
            .map(|d| DetectedFace {
                provider_face_id: d.face_id.unwrap_or_default(),
                confidence: None,
                age: d.face_attributes.as_ref().and_then(|a| a.age),
                gender: d.face_attributes.and_then(|a| a.gender),
            })
            .collect())
    }

    async fn identify(&self, provider_face_ids: &[String]) -> SyncResult<Vec<IdentifyResult>> {
        let ids: Vec<&String> = provider_face_ids.iter().filter(|id| !id.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.identify_chunk_size.max(1)) {
            let response = self
                .authed(self.http.post(self.url("identify")))
                .json(&json!({
                    "faceIds": chunk,
                    "personGroupId": self.config.person_group_id,
                    "maxNumOfCandidatesReturned": MAX_CANDIDATES,
                }))
                .send()
                .await
                .map_err(|e| transport_error("identify", e))?;
            let identified: Vec<Identified> = check("identify", response)
                .await?
                .json()
                .await
                .map_err(|e| transport_error("identify", e))?;
            results.extend(to_results(identified));
        }
        Ok(results)
    }

    async fn search_users_by_image(&self, _image: &[u8]) -> SyncResult<Vec<UserMatch>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_group_persons_indexed_by_local_id() {
        let persons: Vec<GroupPerson> = serde_json::from_str(
            r#"[
                {"personId": "a-1", "name": "Alice", "userData": "5", "persistedFaceIds": []},
                {"personId": "b-2", "name": "Bob", "userData": "not-a-number"},
                {"personId": "c-3", "name": "Carol"}
            ]"#,
        )
        .unwrap();

        let index = index_by_user_data(&persons);
        assert_eq!(index.len(), 1);
        assert_eq!(index[&5].person_id, "a-1");
    }

    #[test]
    fn test_identify_response_mapping() {
        let identified: Vec<Identified> = serde_json::from_str(
            r#"[
                {"faceId": "f1", "candidates": [{"personId": "p1", "confidence": 0.92}]},
                {"faceId": "f2", "candidates": []}
            ]"#,
        )
        .unwrap();

        let results = to_results(identified);
        assert_eq!(results[0].candidates[0].provider_person_id, "p1");
        assert!(results[1].candidates.is_empty());
    }

    #[test]
    fn test_urls_are_scoped_to_group() {
        let provider = AzureFaceProvider::new(AzureConfig {
            endpoint: "https://face.example.com/".to_string(),
            person_group_id: "pg".to_string(),
            ..AzureConfig::default()
        })
        .unwrap();

        assert_eq!(provider.group_url(""), "https://face.example.com/face/v1.0/persongroups/pg");
        assert_eq!(
            provider.group_url("persons"),
            "https://face.example.com/face/v1.0/persongroups/pg/persons"
        );
    }

    fn wire_provider(server: &mockito::Server) -> AzureFaceProvider {
        AzureFaceProvider::new(AzureConfig {
            endpoint: server.url(),
            key: "secret".to_string(),
            person_group_id: "pg".to_string(),
            ..AzureConfig::default()
        })
        .unwrap()
    }

    fn person(person_id: PersonId, name: &str) -> PersonSyncItem {
        PersonSyncItem {
            person_id,
            name: name.to_string(),
            external_id: None,
        }
    }

    fn face(face_id: FaceId, external_id: Option<&str>) -> FaceToLink {
        FaceToLink {
            face_id,
            image: bytes::Bytes::from_static(b"jpeg"),
            external_id: external_id.map(str::to_string),
        }
    }

    async fn enrolled_person(
        server: &mut mockito::Server,
        persisted: &[&str],
    ) -> mockito::Mock {
        server
            .mock("GET", "/face/v1.0/persongroups/pg/persons/p-1")
            .with_status(200)
            .with_body(json!({ "personId": "p-1", "persistedFaceIds": persisted }).to_string())
            .create_async()
            .await
    }

    fn add_face_mock(
        server: &mut mockito::Server,
        face_id: FaceId,
        status: usize,
        persisted: &str,
    ) -> mockito::Mock {
        server
            .mock("POST", "/face/v1.0/persongroups/pg/persons/p-1/persistedFaces")
            .match_query(Matcher::UrlEncoded("userData".into(), face_id.to_string()))
            .with_status(status)
            .with_body(json!({ "persistedFaceId": persisted }).to_string())
    }

    #[tokio::test]
    async fn test_person_listing_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        let first: Vec<_> = (1..=PAGE_SIZE)
            .map(|i| {
                json!({
                    "personId": format!("p-{:04}", i),
                    "name": format!("Person {}", i),
                    "userData": i.to_string(),
                })
            })
            .collect();
        let first_page = server
            .mock("GET", "/face/v1.0/persongroups/pg/persons")
            .match_header(KEY_HEADER, "secret")
            .match_query(Matcher::Exact("top=1000".into()))
            .with_status(200)
            .with_body(serde_json::Value::Array(first).to_string())
            .expect(1)
            .create_async()
            .await;
        let second_page = server
            .mock("GET", "/face/v1.0/persongroups/pg/persons")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("top".into(), "1000".into()),
                Matcher::UrlEncoded("start".into(), "p-1000".into()),
            ]))
            .with_status(200)
            .with_body(r#"[{"personId": "p-1001", "name": "Person 1001", "userData": "1001"}]"#)
            .expect(1)
            .create_async()
            .await;

        let provider = wire_provider(&server);
        let map = provider
            .upsert_persons(&[person(1, "Person 1"), person(1001, "Person 1001")])
            .await
            .unwrap();

        first_page.assert_async().await;
        second_page.assert_async().await;
        assert_eq!(map[&1], "p-0001");
        assert_eq!(map[&1001], "p-1001");
    }

    #[tokio::test]
    async fn test_upsert_renames_creates_and_skips_refused_person() {
        let mut server = mockito::Server::new_async().await;
        let _listing = server
            .mock("GET", "/face/v1.0/persongroups/pg/persons")
            .match_query(Matcher::Exact("top=1000".into()))
            .with_status(200)
            .with_body(
                r#"[
                    {"personId": "p-5", "name": "Old", "userData": "5"},
                    {"personId": "p-8", "name": "Ate", "userData": "8"}
                ]"#,
            )
            .create_async()
            .await;
        let rename = server
            .mock("PATCH", "/face/v1.0/persongroups/pg/persons/p-5")
            .match_body(Matcher::PartialJsonString(r#"{"name": "Five"}"#.into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let _rename_refused = server
            .mock("PATCH", "/face/v1.0/persongroups/pg/persons/p-8")
            .with_status(400)
            .with_body("invalid name")
            .create_async()
            .await;
        let refused = server
            .mock("POST", "/face/v1.0/persongroups/pg/persons")
            .match_body(Matcher::PartialJsonString(r#"{"userData": "6"}"#.into()))
            .with_status(400)
            .with_body("BadArgument")
            .expect(1)
            .create_async()
            .await;
        let created = server
            .mock("POST", "/face/v1.0/persongroups/pg/persons")
            .match_body(Matcher::PartialJsonString(r#"{"name": "Seven", "userData": "7"}"#.into()))
            .with_status(200)
            .with_body(r#"{"personId": "new-7"}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = wire_provider(&server);
        let map = provider
            .upsert_persons(&[
                person(5, "Five"),
                person(6, "Six"),
                person(7, "Seven"),
                person(8, "Eight"),
            ])
            .await
            .unwrap();

        rename.assert_async().await;
        refused.assert_async().await;
        created.assert_async().await;
        assert_eq!(map.len(), 3);
        assert_eq!(map[&5], "p-5");
        assert_eq!(map[&7], "new-7");
        assert_eq!(map[&8], "p-8");
        assert!(!map.contains_key(&6));
    }

    #[tokio::test]
    async fn test_upsert_throttled_creation_fails_the_call() {
        let mut server = mockito::Server::new_async().await;
        let _listing = server
            .mock("GET", "/face/v1.0/persongroups/pg/persons")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let _throttled = server
            .mock("POST", "/face/v1.0/persongroups/pg/persons")
            .with_status(429)
            .with_header("Retry-After", "4")
            .create_async()
            .await;

        let err = wire_provider(&server)
            .upsert_persons(&[person(1, "One")])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_failed_training_still_returns_linked_faces() {
        let mut server = mockito::Server::new_async().await;
        let _person = enrolled_person(&mut server, &[]).await;
        let _added = add_face_mock(&mut server, 1, 200, "pf-1").create_async().await;
        let train = server
            .mock("POST", "/face/v1.0/persongroups/pg/train")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let linked = wire_provider(&server)
            .link_faces_to_person(1, "p-1", &[face(1, None)])
            .await
            .unwrap();

        train.assert_async().await;
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[&1], "pf-1");
    }

    #[tokio::test]
    async fn test_training_failure_status_keeps_links_and_skips_enrolled_face() {
        let mut server = mockito::Server::new_async().await;
        let _person = enrolled_person(&mut server, &["pf-9"]).await;
        let _added = add_face_mock(&mut server, 1, 200, "pf-1").create_async().await;
        let duplicate = add_face_mock(&mut server, 3, 200, "pf-dup")
            .expect(0)
            .create_async()
            .await;
        let _train = server
            .mock("POST", "/face/v1.0/persongroups/pg/train")
            .with_status(202)
            .create_async()
            .await;
        let _training = server
            .mock("GET", "/face/v1.0/persongroups/pg/training")
            .with_status(200)
            .with_body(r#"{"status": "failed", "message": "not enough faces"}"#)
            .create_async()
            .await;

        let linked = wire_provider(&server)
            .link_faces_to_person(1, "p-1", &[face(1, None), face(3, Some("pf-9"))])
            .await
            .unwrap();

        duplicate.assert_async().await;
        assert_eq!(linked[&1], "pf-1");
        assert_eq!(linked[&3], "pf-9");
    }

    #[tokio::test]
    async fn test_retry_after_partial_enrollment_does_not_duplicate() {
        let mut server = mockito::Server::new_async().await;
        let provider = wire_provider(&server);

        let before = enrolled_person(&mut server, &[]).await;
        let first = add_face_mock(&mut server, 1, 200, "pf-1")
            .expect(1)
            .create_async()
            .await;
        let throttled = add_face_mock(&mut server, 2, 503, "").create_async().await;

        let err = provider
            .link_faces_to_person(1, "p-1", &[face(1, None), face(2, None)])
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        before.remove_async().await;
        throttled.remove_async().await;
        let _person = enrolled_person(&mut server, &["pf-1"]).await;
        let _added = add_face_mock(&mut server, 2, 200, "pf-2").create_async().await;
        let _train = server
            .mock("POST", "/face/v1.0/persongroups/pg/train")
            .with_status(202)
            .create_async()
            .await;
        let _training = server
            .mock("GET", "/face/v1.0/persongroups/pg/training")
            .with_status(200)
            .with_body(r#"{"status": "succeeded"}"#)
            .create_async()
            .await;

        let linked = provider
            .link_faces_to_person(1, "p-1", &[face(1, None), face(2, None)])
            .await
            .unwrap();

        first.assert_async().await;
        assert_eq!(linked[&1], "pf-1");
        assert_eq!(linked[&2], "pf-2");
    }
}
