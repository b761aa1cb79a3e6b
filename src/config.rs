//! Face sync service configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub object_store: ObjectStoreConfig,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
    pub recognition: RecognitionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub force_path_style: bool,
    pub url_expiry_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKindConfig {
    Azure,
    Rekognition,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKindConfig,
    pub azure: AzureConfig,
    pub rekognition: RekognitionConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub endpoint: String,
    pub key: String,
    pub person_group_id: String,
    pub recognition_model: String,
    pub detection_model: String,
    pub identify_chunk_size: usize,
    pub train_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RekognitionConfig {
    pub region: Option<String>,
    pub collection_id: String,
    pub face_match_threshold: f32,
    pub quality_filter: String,
    pub max_parallelism: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub base_url: String,
    pub model: String,
    pub top_k: usize,
    /// Minimum cosine similarity for a match. The local provider also uses it
    /// as the automatic assignment threshold in place of
    /// `sync.confidence_threshold`.
    pub face_match_threshold: f32,
    pub max_parallelism: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum provider confidence (0..1) for an automatic assignment.
    /// Ignored by providers that carry their own threshold (`provider.local`).
    pub confidence_threshold: f32,
    pub batch_size: usize,
    pub interval_secs: u64,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Faces assigned to this person are pushed to the auxiliary recognizer.
    pub seed_person_id: i64,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path))?;
        Ok(config)
    }

    /// Defaults when the file does not exist; a file that exists must parse.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            warn!("Config file {} not found, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            object_store: ObjectStoreConfig::default(),
            provider: ProviderConfig::default(),
            sync: SyncConfig::default(),
            recognition: RecognitionConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/catalog.db"),
            max_connections: 5,
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: Some("http://localhost:9000".to_string()),
            region: "us-east-1".to_string(),
            bucket: "photobank".to_string(),
            access_key: None,
            secret_key: None,
            force_path_style: true,
            url_expiry_secs: 3600,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKindConfig::Local,
            azure: AzureConfig::default(),
            rekognition: RekognitionConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://westeurope.api.cognitive.microsoft.com".to_string(),
            key: String::new(),
            person_group_id: "photobank".to_string(),
            recognition_model: "recognition_04".to_string(),
            detection_model: "detection_03".to_string(),
            identify_chunk_size: 10,
            train_timeout_secs: 300,
        }
    }
}

impl Default for RekognitionConfig {
    fn default() -> Self {
        Self {
            region: None,
            collection_id: "photobank".to_string(),
            face_match_threshold: 80.0,
            quality_filter: "AUTO".to_string(),
            max_parallelism: 4,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5555".to_string(),
            model: "buffalo_l".to_string(),
            top_k: 5,
            face_match_threshold: 0.45,
            max_parallelism: 4,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            batch_size: 16,
            interval_secs: 900,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 4000,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:5556".to_string(),
            seed_person_id: 1,
        }
    }
}
