//! SQLite catalog implementation

use std::path::Path;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use tracing::{debug, info};

use super::traits::{CatalogStore, StoredEmbedding};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    BlobCoordinates, FaceAssignment, FaceId, FaceRecord, IdentityStatus, PersonId, PersonRecord,
    PersonRef, PhotoAsset, PhotoId, PhotoRecord,
};
use crate::utils::math::{embedding_from_bytes, embedding_to_bytes};

const FACE_COLUMNS: &str = "id, photo_id, person_id, s3_key_image, sha256_image, etag_image, \
     blob_size_image, identity_status, confidence, external_face_id, provider";

const PERSON_COLUMNS: &str = "id, name, external_id, provider";

/// SQLite-based catalog
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Open (or create) the catalog at `db_path`
    pub async fn new(db_path: &str, max_connections: u32) -> SyncResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::Catalog(e.into()))?;
            }
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&database_url)
            .await?;

        let catalog = Self { pool };
        catalog.initialize().await?;

        Ok(catalog)
    }

    /// Initialize database schema
    async fn initialize(&self) -> SyncResult<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS photos (
                id INTEGER PRIMARY KEY,
                storage_name TEXT NOT NULL,
                relative_path TEXT,
                s3_key_preview TEXT,
                sha256_preview TEXT,
                etag_preview TEXT,
                blob_size_preview INTEGER,
                s3_key_thumbnail TEXT,
                sha256_thumbnail TEXT,
                etag_thumbnail TEXT,
                blob_size_thumbnail INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS persons (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                external_id TEXT,
                provider TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS faces (
                id INTEGER PRIMARY KEY,
                photo_id INTEGER NOT NULL REFERENCES photos(id),
                person_id INTEGER REFERENCES persons(id),
                s3_key_image TEXT,
                sha256_image TEXT,
                etag_image TEXT,
                blob_size_image INTEGER,
                identity_status TEXT NOT NULL DEFAULT 'unresolved'
                    CHECK (identity_status IN ('unresolved', 'identified', 'stop_processing')),
                confidence REAL NOT NULL DEFAULT 0,
                external_face_id TEXT,
                provider TEXT,
                CHECK ((person_id IS NOT NULL) = (identity_status = 'identified'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_faces_person_id ON faces(person_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_faces_identity_status ON faces(identity_status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS face_embeddings (
                face_id INTEGER PRIMARY KEY,
                person_id INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                model TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite catalog initialized");
        Ok(())
    }
}

fn blob_from_row(row: &SqliteRow, suffix: &str) -> Option<BlobCoordinates> {
    let key: Option<String> = row.get(format!("s3_key_{}", suffix).as_str());
    key.map(|key| BlobCoordinates {
        key,
        sha256: row
            .get::<Option<String>, _>(format!("sha256_{}", suffix).as_str())
            .unwrap_or_default(),
        etag: row
            .get::<Option<String>, _>(format!("etag_{}", suffix).as_str())
            .unwrap_or_default(),
        size: row
            .get::<Option<i64>, _>(format!("blob_size_{}", suffix).as_str())
            .unwrap_or_default(),
    })
}

fn face_from_row(row: &SqliteRow) -> FaceRecord {
    let status: String = row.get("identity_status");
    FaceRecord {
        id: row.get("id"),
        photo_id: row.get("photo_id"),
        person_id: row.get("person_id"),
        image: blob_from_row(row, "image"),
        // constrained by the CHECK clause on the column
        identity_status: IdentityStatus::parse(&status).unwrap_or(IdentityStatus::Unresolved),
        confidence: row.get("confidence"),
        external_face_id: row.get("external_face_id"),
        provider: row.get("provider"),
    }
}

fn person_from_row(row: &SqliteRow) -> PersonRecord {
    PersonRecord {
        id: row.get("id"),
        name: row.get("name"),
        external_id: row.get("external_id"),
        provider: row.get("provider"),
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn insert_photo(
        &self,
        id: PhotoId,
        storage_name: &str,
        relative_path: Option<&str>,
    ) -> SyncResult<()> {
        sqlx::query("INSERT INTO photos (id, storage_name, relative_path) VALUES (?, ?, ?)")
            .bind(id)
            .bind(storage_name)
            .bind(relative_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_face(&self, id: FaceId, photo_id: PhotoId) -> SyncResult<()> {
        sqlx::query("INSERT INTO faces (id, photo_id) VALUES (?, ?)")
            .bind(id)
            .bind(photo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_person(&self, id: PersonId, name: &str) -> SyncResult<()> {
        sqlx::query("INSERT INTO persons (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_photo(&self, id: PhotoId) -> SyncResult<Option<PhotoRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, storage_name, relative_path,
                   s3_key_preview, sha256_preview, etag_preview, blob_size_preview,
                   s3_key_thumbnail, sha256_thumbnail, etag_thumbnail, blob_size_thumbnail
            FROM photos
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PhotoRecord {
            id: row.get("id"),
            storage_name: row.get("storage_name"),
            relative_path: row.get("relative_path"),
            preview: blob_from_row(&row, "preview"),
            thumbnail: blob_from_row(&row, "thumbnail"),
        }))
    }

    async fn set_photo_blob(
        &self,
        id: PhotoId,
        asset: PhotoAsset,
        blob: &BlobCoordinates,
    ) -> SyncResult<()> {
        let suffix = asset.as_str();
        let sql = format!(
            "UPDATE photos SET s3_key_{s} = ?, sha256_{s} = ?, etag_{s} = ?, blob_size_{s} = ? WHERE id = ?",
            s = suffix
        );
        let result = sqlx::query(&sql)
            .bind(&blob.key)
            .bind(&blob.sha256)
            .bind(&blob.etag)
            .bind(blob.size)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("photo", id));
        }
        debug!("Stored {} coordinates for photo {}", suffix, id);
        Ok(())
    }

    async fn get_face(&self, id: FaceId) -> SyncResult<Option<FaceRecord>> {
        let sql = format!("SELECT {} FROM faces WHERE id = ?", FACE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(face_from_row))
    }

    async fn set_face_blob(&self, id: FaceId, blob: &BlobCoordinates) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE faces
            SET s3_key_image = ?, sha256_image = ?, etag_image = ?, blob_size_image = ?
            WHERE id = ?
            "#,
        )
        .bind(&blob.key)
        .bind(&blob.sha256)
        .bind(&blob.etag)
        .bind(blob.size)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("face", id));
        }
        debug!("Stored image coordinates for face {}", id);
        Ok(())
    }

    async fn list_faces(&self, offset: i64, limit: i64) -> SyncResult<Vec<FaceRecord>> {
        let sql = format!(
            "SELECT {} FROM faces ORDER BY id LIMIT ? OFFSET ?",
            FACE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(face_from_row).collect())
    }

    async fn count_faces(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM faces")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    async fn apply_assignment(&self, id: FaceId, assignment: FaceAssignment) -> SyncResult<bool> {
        let (person_id, status) = assignment.columns();
        let confidence = if person_id.is_some() { 1.0 } else { 0.0 };

        let mut tx = self.pool.begin().await?;

        // A face moved to another person must be enrolled again under that person.
        let result = sqlx::query(
            r#"
            UPDATE faces
            SET external_face_id = CASE WHEN person_id IS ? THEN external_face_id ELSE NULL END,
                provider = CASE WHEN person_id IS ? THEN provider ELSE NULL END,
                person_id = ?,
                identity_status = ?,
                confidence = ?
            WHERE id = ?
            "#,
        )
        .bind(person_id)
        .bind(person_id)
        .bind(person_id)
        .bind(status.as_str())
        .bind(confidence)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // stale embeddings would keep matching the previous person
        sqlx::query("DELETE FROM face_embeddings WHERE face_id = ? AND person_id IS NOT ?")
            .bind(id)
            .bind(person_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_identification(
        &self,
        id: FaceId,
        person_id: PersonId,
        confidence: f64,
    ) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE faces
            SET person_id = ?, identity_status = 'identified', confidence = ?
            WHERE id = ? AND identity_status = 'unresolved'
            "#,
        )
        .bind(person_id)
        .bind(confidence)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unresolved_faces(&self) -> SyncResult<Vec<FaceRecord>> {
        let sql = format!(
            "SELECT {} FROM faces WHERE identity_status = 'unresolved' AND s3_key_image IS NOT NULL ORDER BY id",
            FACE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(face_from_row).collect())
    }

    async fn faces_pending_enrollment(&self, provider: &str) -> SyncResult<Vec<FaceRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM faces
            WHERE identity_status = 'identified'
              AND person_id IS NOT NULL
              AND s3_key_image IS NOT NULL
              AND (external_face_id IS NULL OR provider IS NULL OR provider <> ?)
            ORDER BY person_id, id
            "#,
            FACE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(face_from_row).collect())
    }

    async fn set_face_enrollment(
        &self,
        id: FaceId,
        external_face_id: &str,
        provider: &str,
    ) -> SyncResult<()> {
        let result = sqlx::query("UPDATE faces SET external_face_id = ?, provider = ? WHERE id = ?")
            .bind(external_face_id)
            .bind(provider)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("face", id));
        }
        Ok(())
    }

    async fn faces_for_person(&self, person_id: PersonId) -> SyncResult<Vec<FaceRecord>> {
        let sql = format!(
            "SELECT {} FROM faces WHERE person_id = ? AND s3_key_image IS NOT NULL ORDER BY id",
            FACE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(person_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(face_from_row).collect())
    }

    async fn get_person(&self, id: PersonId) -> SyncResult<Option<PersonRecord>> {
        let sql = format!("SELECT {} FROM persons WHERE id = ?", PERSON_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(person_from_row))
    }

    async fn list_persons(&self) -> SyncResult<Vec<PersonRecord>> {
        let sql = format!("SELECT {} FROM persons ORDER BY id", PERSON_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(person_from_row).collect())
    }

    async fn persons_for_sync(&self, provider: &str, full: bool) -> SyncResult<Vec<PersonRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM persons
            WHERE (provider IS NULL OR provider = ?)
              AND (? OR external_id IS NULL)
            ORDER BY id
            "#,
            PERSON_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(provider)
            .bind(full)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(person_from_row).collect())
    }

    async fn set_person_external_id(
        &self,
        id: PersonId,
        external_id: &str,
        provider: &str,
    ) -> SyncResult<()> {
        let result = sqlx::query("UPDATE persons SET external_id = ?, provider = ? WHERE id = ?")
            .bind(external_id)
            .bind(provider)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("person", id));
        }
        Ok(())
    }

    async fn persons_with_faces(&self) -> SyncResult<Vec<PersonRef>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id AS id, p.name AS name, COUNT(f.id) AS face_count
            FROM persons p
            JOIN faces f ON f.person_id = p.id
            GROUP BY p.id, p.name
            ORDER BY p.name, p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PersonRef {
                id: row.get("id"),
                name: row.get("name"),
                face_count: row.get("face_count"),
            })
            .collect())
    }

    async fn upsert_embedding(&self, embedding: &StoredEmbedding) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO face_embeddings (face_id, person_id, embedding, model, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(face_id) DO UPDATE SET
                person_id = excluded.person_id,
                embedding = excluded.embedding,
                model = excluded.model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(embedding.face_id)
        .bind(embedding.person_id)
        .bind(embedding_to_bytes(&embedding.vector))
        .bind(&embedding.model)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        debug!("Saved embedding for face {}", embedding.face_id);
        Ok(())
    }

    async fn all_embeddings(&self) -> SyncResult<Vec<StoredEmbedding>> {
        let rows = sqlx::query("SELECT face_id, person_id, embedding, model FROM face_embeddings")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let bytes: Vec<u8> = row.get("embedding");
                StoredEmbedding {
                    face_id: row.get("face_id"),
                    person_id: row.get("person_id"),
                    vector: embedding_from_bytes(&bytes),
                    model: row.get("model"),
                }
            })
            .collect())
    }
}
