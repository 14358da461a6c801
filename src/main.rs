use std::sync::Arc;

use boardsync::config::{ConfigError, SyncConfig};
use boardsync::services::access::{AccessResolver, PgAccessResolver, StaticAccessResolver};
use boardsync::services::snapshot_store::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use boardsync::{db, routes, state};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("server io: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    tracing_subscriber::fmt::init();
    if let Err(e) = dotenvy::dotenv() {
        debug!(error = %e, "no .env file loaded");
    }

    let config = SyncConfig::from_env();
    config.validate()?;

    let (store, access): (Arc<dyn SnapshotStore>, Arc<dyn AccessResolver>) = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections).await?;
            (Arc::new(PgSnapshotStore::new(pool.clone())), Arc::new(PgAccessResolver::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set; snapshots are kept in memory and every ticket is accepted");
            (Arc::new(MemorySnapshotStore::new()), Arc::new(StaticAccessResolver::open()))
        }
    };

    let port = config.port;
    let state = state::AppState::new(config, store, access);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    info!(%port, "boardsync listening");
    axum::serve(listener, app).await?;
    Ok(())
}
