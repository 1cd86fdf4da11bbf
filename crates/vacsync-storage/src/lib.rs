//! Listing persistence gateway + HTTP fetch utilities for vacsync.
//!
//! A [`ListingStore`] owns the persisted listings. The sync path never writes
//! through it directly: each pass opens a [`ListingSession`], performs one
//! batched lookup and hands a [`ChangeSet`] to [`ListingSession::apply`],
//! which lands every write or none. Dropping a session without applying it
//! discards its scope.

use async_trait::async_trait;
use thiserror::Error;
use vacsync_core::{ChangeSet, Listing, ListingFilter, ListingPayload};

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryListingStore;
pub use postgres::{PgListingStore, PoolSettings};

pub const CRATE_NAME: &str = "vacsync-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("a listing with external_id {0} already exists")]
    DuplicateExternalId(i64),
    #[error("listing {0} not found")]
    NotFound(i64),
    #[error("listing store is closed")]
    Closed,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Maps a unique-constraint violation on `external_id` to [`PersistenceError::DuplicateExternalId`].
    pub fn from_write(err: sqlx::Error, external_id: Option<i64>) -> Self {
        let unique_violation = err
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        match (unique_violation, external_id) {
            (true, Some(external_id)) => Self::DuplicateExternalId(external_id),
            _ => Self::from(err),
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Self::Closed,
            other => Self::Database(other),
        }
    }
}

/// Persistence gateway for listings.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Opens the storage scope for one sync pass.
    async fn begin(&self) -> Result<Box<dyn ListingSession>, PersistenceError>;

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>, PersistenceError>;

    async fn get(&self, id: i64) -> Result<Option<Listing>, PersistenceError>;

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Listing>, PersistenceError>;

    async fn create(&self, payload: &ListingPayload) -> Result<Listing, PersistenceError>;

    async fn update(&self, id: i64, payload: &ListingPayload) -> Result<Listing, PersistenceError>;

    async fn delete(&self, id: i64) -> Result<(), PersistenceError>;

    /// Releases the underlying resources. Later calls fail with [`PersistenceError::Closed`].
    async fn close(&self);
}

/// Storage scope of a single sync pass.
#[async_trait]
pub trait ListingSession: Send {
    /// One batched lookup for exactly the given keys. An empty slice issues no query.
    async fn find_by_external_ids(
        &mut self,
        external_ids: &[i64],
    ) -> Result<Vec<Listing>, PersistenceError>;

    /// Applies all staged creates and updates atomically and returns the number of created rows.
    ///
    /// Updates whose patch matches the stored fields are not written, so `updated_at` stays put.
    async fn apply(self: Box<Self>, changes: ChangeSet) -> Result<usize, PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_maps_to_closed_store() {
        assert!(matches!(
            PersistenceError::from(sqlx::Error::PoolClosed),
            PersistenceError::Closed
        ));
        assert!(matches!(
            PersistenceError::from_write(sqlx::Error::PoolClosed, Some(3)),
            PersistenceError::Closed
        ));
        assert!(matches!(
            PersistenceError::from(sqlx::Error::RowNotFound),
            PersistenceError::Database(_)
        ));
    }
}
