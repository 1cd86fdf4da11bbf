//! Sync pass orchestration: fetch a batch, reconcile it against storage, persist atomically.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use vacsync_core::AppConfig;
use vacsync_source::{FetchContext, HttpSourceClient, SourceClient, SourceFetchError};
use vacsync_storage::{ListingStore, PersistenceError};

pub mod reconcile;
pub mod scheduler;

pub use reconcile::{distinct_external_ids, reconcile};
pub use scheduler::{PassRunner, SchedulerError, SchedulerState, SyncScheduler, TickOutcome};

pub const CRATE_NAME: &str = "vacsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source fetch failed: {0}")]
    Source(#[from] SourceFetchError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("sync scheduler is stopped")]
    Stopped,
}

/// What started a pass. Recorded on the pass span and summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    Startup,
    Scheduled,
    OnDemand,
}

impl PassTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Scheduled => "scheduled",
            Self::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for PassTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub trigger: PassTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Updates whose fields already matched the stored row.
    pub unchanged: usize,
}

#[derive(Clone)]
pub struct SyncPipeline {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn ListingStore>,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn SourceClient>, store: Arc<dyn ListingStore>) -> Self {
        Self { source, store }
    }

    /// Pipeline reading from the configured upstream URL.
    pub fn from_config(config: &AppConfig, store: Arc<dyn ListingStore>) -> anyhow::Result<Self> {
        let source = HttpSourceClient::from_config(config)?;
        Ok(Self::new(Arc::new(source), store))
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Runs one fetch, reconcile and persist pass.
    ///
    /// Callers are responsible for mutual exclusion; see [`PassRunner`]. Nothing is written
    /// unless the whole batch commits.
    pub async fn run_once(&self, trigger: PassTrigger) -> Result<PassSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_pass", %run_id, trigger = trigger.as_str());
        self.run_pass(run_id, trigger).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid, trigger: PassTrigger) -> Result<PassSummary, SyncError> {
        let started_at = Utc::now();
        let ctx = FetchContext::new(run_id);

        let batch = self.source.fetch_batch(&ctx).await?;
        let fetched = batch.len();
        info!(origin = self.source.origin(), fetched, "fetched batch");

        let mut session = self.store.begin().await?;
        let keys = distinct_external_ids(&batch);
        let existing = session.find_by_external_ids(&keys).await?;
        let changes = reconcile(batch, existing);

        let updated = changes.updates.len();
        let unchanged = changes.updates.iter().filter(|u| u.is_noop()).count();
        let created = session.apply(changes).await?;

        let finished_at = Utc::now();
        info!(
            fetched,
            created,
            updated,
            unchanged,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "sync pass committed"
        );

        Ok(PassSummary {
            run_id,
            trigger,
            started_at,
            finished_at,
            fetched,
            created,
            updated,
            unchanged,
        })
    }
}
