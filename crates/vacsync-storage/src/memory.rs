//! In-process listing store with the same transactional contract as Postgres.
//!
//! Writes of a session are staged on a copy of the table and swapped in only
//! when every write succeeded, so a failed apply leaves nothing behind. The
//! unique `external_id` constraint is checked on every write, like the
//! database index does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use vacsync_core::{listing_read_order, ChangeSet, Listing, ListingFilter, ListingPayload};

use crate::{ListingSession, ListingStore, PersistenceError};

#[derive(Debug, Default, Clone)]
struct Table {
    rows: BTreeMap<i64, Listing>,
    next_id: i64,
}

impl Table {
    fn find_external(&self, external_id: i64) -> Option<&Listing> {
        self.rows.values().find(|l| l.external_id == Some(external_id))
    }

    fn check_unique(&self, external_id: Option<i64>, except_id: Option<i64>) -> Result<(), PersistenceError> {
        let Some(external_id) = external_id else {
            return Ok(());
        };
        match self.find_external(external_id) {
            Some(existing) if Some(existing.id) != except_id => {
                Err(PersistenceError::DuplicateExternalId(external_id))
            }
            _ => Ok(()),
        }
    }

    fn insert(&mut self, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        self.check_unique(payload.external_id, None)?;
        self.next_id += 1;
        let now = Utc::now();
        let listing = Listing {
            id: self.next_id,
            external_id: payload.external_id,
            fields: payload.fields.clone(),
            created_at: now,
            updated_at: now,
        };
        self.rows.insert(listing.id, listing.clone());
        Ok(listing)
    }

    fn overwrite(&mut self, id: i64, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        self.check_unique(payload.external_id, Some(id))?;
        let row = self.rows.get_mut(&id).ok_or(PersistenceError::NotFound(id))?;
        row.external_id = payload.external_id;
        row.fields = payload.fields.clone();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<Table>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    lookups: AtomicUsize,
    fail_after_writes: Option<usize>,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PersistenceError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryListingStore {
    shared: Arc<Shared>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose session apply fails once `writes` writes of that apply have been staged.
    pub fn failing_after_writes(writes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                fail_after_writes: Some(writes),
                ..Shared::default()
            }),
        }
    }

    pub async fn snapshot(&self) -> Vec<Listing> {
        self.shared.table.lock().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of batched key lookups issued by sessions (empty lookups excluded).
    pub fn lookup_count(&self) -> usize {
        self.shared.lookups.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn begin(&self) -> Result<Box<dyn ListingSession>, PersistenceError> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>, PersistenceError> {
        self.shared.ensure_open()?;
        let table = self.shared.table.lock().await;
        let mut rows = table
            .rows
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(listing_read_order);
        Ok(rows)
    }

    async fn get(&self, id: i64) -> Result<Option<Listing>, PersistenceError> {
        self.shared.ensure_open()?;
        Ok(self.shared.table.lock().await.rows.get(&id).cloned())
    }

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Listing>, PersistenceError> {
        self.shared.ensure_open()?;
        Ok(self.shared.table.lock().await.find_external(external_id).cloned())
    }

    async fn create(&self, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        self.shared.ensure_open()?;
        self.shared.table.lock().await.insert(payload)
    }

    async fn update(&self, id: i64, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        self.shared.ensure_open()?;
        self.shared.table.lock().await.overwrite(id, payload)
    }

    async fn delete(&self, id: i64) -> Result<(), PersistenceError> {
        self.shared.ensure_open()?;
        match self.shared.table.lock().await.rows.remove(&id) {
            Some(_) => Ok(()),
            None => Err(PersistenceError::NotFound(id)),
        }
    }

    async fn close(&self) {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

struct MemorySession {
    shared: Arc<Shared>,
}

#[async_trait]
impl ListingSession for MemorySession {
    async fn find_by_external_ids(
        &mut self,
        external_ids: &[i64],
    ) -> Result<Vec<Listing>, PersistenceError> {
        self.shared.ensure_open()?;
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.lookups.fetch_add(1, Ordering::SeqCst);
        let table = self.shared.table.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|l| l.external_id.is_some_and(|k| external_ids.contains(&k)))
            .cloned()
            .collect())
    }

    async fn apply(self: Box<Self>, changes: ChangeSet) -> Result<usize, PersistenceError> {
        self.shared.ensure_open()?;
        let mut table = self.shared.table.lock().await;
        let mut staged = (*table).clone();
        let mut writes = 0usize;
        let fail_after = self.shared.fail_after_writes;

        let mut count_write = || {
            if fail_after.is_some_and(|limit| writes >= limit) {
                return Err(PersistenceError::Backend(format!(
                    "injected failure after {writes} writes"
                )));
            }
            writes += 1;
            Ok(())
        };

        for update in changes.updates.iter().filter(|u| !u.is_noop()) {
            count_write()?;
            staged.overwrite(update.id(), &update.patched_payload())?;
        }
        for payload in &changes.creates {
            count_write()?;
            staged.insert(payload)?;
        }

        *table = staged;
        Ok(changes.creates.len())
    }
}
