//! Face catalog sync service
//!
//! Runs the provider synchronization loop, single sync passes, recognizer
//! registration and the photo-created handler from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use facesync::blob::{ContentAddressableUploader, ObjectStore, S3ObjectStore};
use facesync::catalog::{FaceCatalogService, MediaUrlResolver};
use facesync::config::Config;
use facesync::ingest::{PhotoCreated, PhotoCreatedHandler};
use facesync::model::FaceAssignment;
use facesync::provider::build_provider;
use facesync::recognition::{HttpRecognitionClient, RecognitionRegistrationService};
use facesync::storage::SqliteCatalog;
use facesync::sync::FaceSyncEngine;

#[derive(Parser)]
#[command(name = "facesync", version, about = "Face catalog synchronization service")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = Config::default_path())]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync passes on the configured interval until Ctrl-C
    Run,
    /// Run a single sync pass
    Sync {
        /// Re-send every person, not only those without a provider id
        #[arg(long)]
        full: bool,
    },
    /// Push seed-person faces to the auxiliary recognizer
    Register,
    /// Make sure the provider-side group or collection exists
    EnsureReady,
    /// Store the blobs of a photo-created event read from a JSON file
    Ingest {
        event: PathBuf,
    },
    /// Print one page of faces
    Faces {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 50)]
        page_size: i64,
    },
    /// Set a face's identity manually (-1 locks it as no match)
    Assign {
        face_id: i64,
        #[arg(allow_negative_numbers = true)]
        person_id: Option<i64>,
    },
}

struct App {
    config: Config,
    catalog: Arc<SqliteCatalog>,
    store: Arc<dyn ObjectStore>,
    faces: Arc<FaceCatalogService<SqliteCatalog>>,
}

impl App {
    async fn init(config: Config) -> Result<Self> {
        let db_path = config
            .database
            .sqlite_path
            .to_str()
            .context("sqlite path is not valid UTF-8")?;
        let catalog = Arc::new(
            SqliteCatalog::new(db_path, config.database.max_connections)
                .await
                .with_context(|| format!("failed to open catalog at {}", db_path))?,
        );
        info!("SQLite catalog initialized at: {}", db_path);

        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(&config.object_store).await);
        let urls = MediaUrlResolver::new(
            store.clone(),
            Duration::from_secs(config.object_store.url_expiry_secs),
        );
        let faces = Arc::new(FaceCatalogService::new(catalog.clone(), urls));

        Ok(Self {
            config,
            catalog,
            store,
            faces,
        })
    }

    async fn engine(&self) -> Result<FaceSyncEngine<SqliteCatalog>> {
        let provider = build_provider(&self.config, self.catalog.clone())
            .await
            .context("failed to build face provider")?;
        info!("Face provider: {}", provider.kind().as_str());
        Ok(FaceSyncEngine::new(
            self.faces.clone(),
            provider,
            self.store.clone(),
            &self.config.sync,
        ))
    }

    fn registration(&self) -> Result<RecognitionRegistrationService<SqliteCatalog>> {
        let client = HttpRecognitionClient::new(&self.config.recognition.base_url)?;
        Ok(RecognitionRegistrationService::new(
            self.catalog.clone(),
            self.store.clone(),
            Arc::new(client),
            self.config.recognition.seed_person_id,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    let cli = Cli::parse();

    info!("Starting facesync v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_or_default(&cli.config)?;

    let app = App::init(config).await?;
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match cli.command {
        Commands::Run => run_loop(&app, &cancel).await?,
        Commands::Sync { full } => {
            let report = app.engine().await?.run_once(full, &cancel).await?;
            print_json(&report)?;
        }
        Commands::Register => {
            let summary = app.registration()?.register_identified_faces(&cancel).await;
            print_json(&summary)?;
        }
        Commands::EnsureReady => {
            app.engine().await?.ensure_ready(&cancel).await?;
            info!("Provider is ready");
        }
        Commands::Ingest { event } => {
            let raw = tokio::fs::read(&event)
                .await
                .with_context(|| format!("failed to read event {}", event.display()))?;
            let event: PhotoCreated =
                serde_json::from_slice(&raw).context("failed to parse photo-created event")?;
            let handler = PhotoCreatedHandler::new(
                app.catalog.clone(),
                ContentAddressableUploader::new(app.store.clone()),
            );
            print_json(&handler.handle(&event, &cancel).await)?;
        }
        Commands::Faces { page, page_size } => {
            print_json(&app.faces.get_faces_page(page, page_size).await?)?;
        }
        Commands::Assign { face_id, person_id } => {
            let assignment = FaceAssignment::from_legacy(person_id);
            app.faces.update_face(face_id, assignment).await?;
            info!("Face {} set to {:?}", face_id, assignment);
        }
    }

    Ok(())
}

/// Periodic sync passes, plus recognizer registration when enabled
async fn run_loop(app: &App, cancel: &CancellationToken) -> Result<()> {
    let engine = app.engine().await?;
    let registration = if app.config.recognition.enabled {
        Some(app.registration()?)
    } else {
        None
    };

    let mut ticker = tokio::time::interval(app.config.sync.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Sync loop started (every {:?})", app.config.sync.interval());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match engine.run_once(false, cancel).await {
            Ok(report) if report.is_clean() => info!("Sync pass completed"),
            Ok(report) => warn!(
                "Sync pass completed with failures: {}",
                serde_json::to_string(&report).unwrap_or_default()
            ),
            Err(e) => error!("Sync pass failed: {}", e),
        }

        if let Some(registration) = &registration {
            registration.register_identified_faces(cancel).await;
        }
    }

    info!("Sync loop stopped");
    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received, cancelling work...");
        cancel.cancel();
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
