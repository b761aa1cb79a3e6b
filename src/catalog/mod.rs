//! Read side of the face catalog and its identity mutation point

pub mod cache;
pub mod media;
pub mod service;

pub use cache::ReferenceDataCache;
pub use media::MediaUrlResolver;
pub use service::{FaceCatalogService, FacePage, FaceView};
