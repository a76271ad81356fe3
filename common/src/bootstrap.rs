// Bootstrap utilities for the scheduler binary and integration tests

use crate::config::{Settings, StoreBackend};
use crate::db::DbPool;
use crate::store::{EntityStore, MemoryStore, PgEntityStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Initialize database pool and apply pending migrations
///
/// # Errors
/// Returns error if the pool cannot connect or a migration fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Build the entity store selected by `store.backend`
///
/// # Errors
/// Returns error if the postgres backend is selected and the database is unreachable
#[tracing::instrument(skip(settings), fields(backend = ?settings.store.backend))]
pub async fn init_entity_store(settings: &Settings) -> Result<Arc<dyn EntityStore>> {
    let store: Arc<dyn EntityStore> = match settings.store.backend {
        StoreBackend::Postgres => {
            let pool = init_database_pool(settings).await?;
            Arc::new(PgEntityStore::new(pool))
        }
        StoreBackend::Memory => {
            info!("Using in-memory entity store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}
