//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the configuration, the snapshot store, the access resolver,
//! the room registry and the per-connection rate limiter. Board state
//! itself lives inside room actors, never here.

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::rate_limit::RateLimiter;
use crate::services::access::AccessResolver;
use crate::services::registry::RoomRegistry;
use crate::services::room::RoomDeps;
use crate::services::snapshot_store::SnapshotStore;

/// Shared application state. Clone is required by Axum; every field is
/// Arc-wrapped or cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn SnapshotStore>,
    pub access: Arc<dyn AccessResolver>,
    pub registry: RoomRegistry,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    #[must_use]
    pub fn new(config: SyncConfig, store: Arc<dyn SnapshotStore>, access: Arc<dyn AccessResolver>) -> Self {
        let rate_limiter = RateLimiter::new(config.mutation_bucket, config.awareness_bucket);
        Self { config: Arc::new(config), store, access, registry: RoomRegistry::new(), rate_limiter }
    }

    /// What a room actor needs from the process.
    #[must_use]
    pub fn room_deps(&self) -> RoomDeps {
        RoomDeps { config: Arc::clone(&self.config), store: Arc::clone(&self.store), registry: self.registry.clone() }
    }
}
