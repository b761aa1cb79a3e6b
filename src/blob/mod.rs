//! Object store access and the content-addressable upload path

pub mod keys;
pub mod memory;
pub mod s3;
pub mod store;
pub mod uploader;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;
pub use store::{ObjectStat, ObjectStore, PutBody};
pub use uploader::{ContentAddressableUploader, HashingStream};
