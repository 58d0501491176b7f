use anyhow::{Context, Result};
use presence_core::{Ledger, MemoryRepository, Registry, Repository, SessionCoordinator};
use presence_store::{SqliteRepository, TemplateCodec, TemplateKey};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config, StoreKind};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        store = config.store.as_str(),
        db = %config.db_path.display(),
        dimension = config.dimension,
        threshold = config.match_threshold,
        "presenced starting"
    );

    let coordinator = build_coordinator(&config)?;
    let engine = engine::spawn_engine(coordinator, config.store.as_str())
        .context("spawning engine thread")?;
    let service = AttendanceService::new(engine, config.frame_deadline());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}

/// Open the configured store and wire registry, ledger and coordinator.
///
/// Fails fast: a store that cannot be opened or holds vectors of the wrong
/// dimension keeps the daemon from starting.
fn build_coordinator(config: &Config) -> Result<SessionCoordinator> {
    let repo: Arc<dyn Repository> = match config.store {
        StoreKind::Memory => Arc::new(MemoryRepository::new()),
        StoreKind::Sqlite => {
            let codec = match &config.template_key_path {
                Some(path) => TemplateCodec::sealed(
                    &TemplateKey::load(path)
                        .with_context(|| format!("loading template key {}", path.display()))?,
                ),
                None => TemplateCodec::plain(),
            };
            Arc::new(
                SqliteRepository::open(&config.db_path, codec)
                    .with_context(|| format!("opening {}", config.db_path.display()))?,
            )
        }
    };

    let registry = Arc::new(
        Registry::open(repo.clone(), config.dimension).context("loading encoding registry")?,
    );
    let ledger = Arc::new(Ledger::new(repo).with_duplicate_audit(config.audit_duplicates));
    Ok(SessionCoordinator::new(
        registry,
        ledger,
        config.match_threshold,
    ))
}
