//! Relational catalog for photos, faces and persons

pub mod traits;
pub mod sqlite;

pub use traits::{CatalogStore, StoredEmbedding};
pub use sqlite::SqliteCatalog;
