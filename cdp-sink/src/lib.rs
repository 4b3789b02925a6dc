//! cdp-sink library interface
//!
//! Ingestion of integration results, identity resolution, member merging
//! and multi-source enrichment. The binary wires these together; tests use
//! them directly.

pub mod attributes;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod merge;
pub mod organizations;
pub mod sync;
pub mod tasks;
pub mod types;
pub mod utils;

pub use crate::error::{Disposition, SinkError, SinkResult};

use std::sync::Arc;

use cdp_common::events::EventBus;
use sqlx::SqlitePool;

use crate::config::SinkConfig;
use crate::enrichment::{Arbiter, EnrichmentService, EnrichmentSource};
use crate::ingest::IngestService;
use crate::merge::MergeService;
use crate::sync::SearchSyncEmitter;

/// Services shared by the queue worker, the scheduler and the CLI commands
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub sync: Arc<dyn SearchSyncEmitter>,
    pub ingest: Arc<IngestService>,
    pub merge: Arc<MergeService>,
    pub enrichment: Arc<EnrichmentService>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        config: &SinkConfig,
        event_bus: EventBus,
        sync: Arc<dyn SearchSyncEmitter>,
        sources: Vec<Arc<dyn EnrichmentSource>>,
        arbiter: Option<Arbiter>,
    ) -> Self {
        let ingest = IngestService::new(db.clone(), config, Arc::clone(&sync), event_bus.clone());
        let merge = MergeService::new(
            db.clone(),
            Arc::clone(&sync),
            event_bus.clone(),
            config.db_lock_max_wait_ms,
        );
        let enrichment = EnrichmentService::new(
            db.clone(),
            config,
            sources,
            arbiter,
            Arc::clone(&sync),
            event_bus.clone(),
        );
        Self {
            db,
            event_bus,
            sync,
            ingest: Arc::new(ingest),
            merge: Arc::new(merge),
            enrichment: Arc::new(enrichment),
        }
    }
}
