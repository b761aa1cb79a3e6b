//! Catalog records: photos, faces, persons and their blob coordinates.

use serde::{Deserialize, Serialize};

pub type PhotoId = i64;
pub type FaceId = i64;
pub type PersonId = i64;

/// Where a blob lives and what it contained when written.
///
/// The four fields are always persisted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCoordinates {
    pub key: String,
    pub sha256: String,
    pub etag: String,
    pub size: i64,
}

/// Which photo asset a set of blob coordinates belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhotoAsset {
    Preview,
    Thumbnail,
}

impl PhotoAsset {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoAsset::Preview => "preview",
            PhotoAsset::Thumbnail => "thumbnail",
        }
    }
}

/// Per-face identity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityStatus {
    Unresolved,
    Identified,
    /// Manual "no match": the sync loop never touches this face again.
    StopProcessing,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Unresolved => "unresolved",
            IdentityStatus::Identified => "identified",
            IdentityStatus::StopProcessing => "stop_processing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unresolved" => Some(IdentityStatus::Unresolved),
            "identified" => Some(IdentityStatus::Identified),
            "stop_processing" => Some(IdentityStatus::StopProcessing),
            _ => None,
        }
    }
}

/// Outcome of a manual identity decision at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaceAssignment {
    Assigned(PersonId),
    /// "No match": clears the person and locks the face.
    Rejected,
    /// Hands the face back to automatic identification.
    Unresolved,
}

impl FaceAssignment {
    /// Translate the legacy nullable id, where `-1` means "no match".
    pub fn from_legacy(person_id: Option<PersonId>) -> Self {
        match person_id {
            Some(-1) => FaceAssignment::Rejected,
            Some(id) if id > 0 => FaceAssignment::Assigned(id),
            _ => FaceAssignment::Unresolved,
        }
    }

    /// Column values `(person_id, status)` this assignment maps to.
    pub fn columns(&self) -> (Option<PersonId>, IdentityStatus) {
        match *self {
            FaceAssignment::Assigned(id) => (Some(id), IdentityStatus::Identified),
            FaceAssignment::Rejected => (None, IdentityStatus::StopProcessing),
            FaceAssignment::Unresolved => (None, IdentityStatus::Unresolved),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub storage_name: String,
    pub relative_path: Option<String>,
    pub preview: Option<BlobCoordinates>,
    pub thumbnail: Option<BlobCoordinates>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: FaceId,
    pub photo_id: PhotoId,
    pub person_id: Option<PersonId>,
    pub image: Option<BlobCoordinates>,
    pub identity_status: IdentityStatus,
    pub confidence: f64,
    /// Provider-side face id once enrolled.
    pub external_face_id: Option<String>,
    /// Provider kind that holds `external_face_id`.
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: PersonId,
    pub name: String,
    pub external_id: Option<String>,
    pub provider: Option<String>,
}

/// Person projection served from the reference-data cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: PersonId,
    pub name: String,
    pub face_count: i64,
}
