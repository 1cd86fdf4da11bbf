//! Postgres-backed listing store (sqlx).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};
use vacsync_core::{ChangeSet, Listing, ListingFields, ListingFilter, ListingPayload};

use crate::{ListingSession, ListingStore, PersistenceError};

const LISTING_COLUMNS: &str = "id, external_id, title, timetable_mode_name, tag_name, city_name, \
     published_at, is_remote_available, is_hot, created_at, updated_at";

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub test_before_acquire: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 30,
            acquire_timeout: Duration::from_secs(10),
            test_before_acquire: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, settings: PoolSettings) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .test_before_acquire(settings.test_before_acquire)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        fields: ListingFields {
            title: row.try_get("title")?,
            timetable_mode_name: row.try_get("timetable_mode_name")?,
            tag_name: row.try_get("tag_name")?,
            city_name: row.try_get("city_name")?,
            published_at: row.try_get("published_at")?,
            is_remote_available: row.try_get("is_remote_available")?,
            is_hot: row.try_get("is_hot")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn filter_term(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn insert_sql() -> String {
    format!(
        r#"
        INSERT INTO listings (external_id, title, timetable_mode_name, tag_name, city_name,
                              published_at, is_remote_available, is_hot)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {LISTING_COLUMNS}
        "#
    )
}

fn update_sql() -> String {
    format!(
        r#"
        UPDATE listings
           SET external_id = $2,
               title = $3,
               timetable_mode_name = $4,
               tag_name = $5,
               city_name = $6,
               published_at = $7,
               is_remote_available = $8,
               is_hot = $9,
               updated_at = NOW()
         WHERE id = $1
        RETURNING {LISTING_COLUMNS}
        "#
    )
}

async fn insert_listing(
    conn: &mut sqlx::PgConnection,
    payload: &ListingPayload,
) -> Result<Listing, PersistenceError> {
    let sql = insert_sql();
    let f = &payload.fields;
    let row = sqlx::query(&sql)
        .bind(payload.external_id)
        .bind(&f.title)
        .bind(&f.timetable_mode_name)
        .bind(&f.tag_name)
        .bind(&f.city_name)
        .bind(f.published_at)
        .bind(f.is_remote_available)
        .bind(f.is_hot)
        .fetch_one(conn)
        .await
        .map_err(|e| PersistenceError::from_write(e, payload.external_id))?;
    Ok(listing_from_row(&row)?)
}

async fn update_listing(
    conn: &mut sqlx::PgConnection,
    id: i64,
    payload: &ListingPayload,
) -> Result<Listing, PersistenceError> {
    let sql = update_sql();
    let f = &payload.fields;
    let row = sqlx::query(&sql)
        .bind(id)
        .bind(payload.external_id)
        .bind(&f.title)
        .bind(&f.timetable_mode_name)
        .bind(&f.tag_name)
        .bind(&f.city_name)
        .bind(f.published_at)
        .bind(f.is_remote_available)
        .bind(f.is_hot)
        .fetch_optional(conn)
        .await
        .map_err(|e| PersistenceError::from_write(e, payload.external_id))?
        .ok_or(PersistenceError::NotFound(id))?;
    Ok(listing_from_row(&row)?)
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn begin(&self) -> Result<Box<dyn ListingSession>, PersistenceError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgListingSession { tx }))
    }

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>, PersistenceError> {
        let sql = format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM listings
             WHERE ($1::text IS NULL OR timetable_mode_name ILIKE '%' || $1 || '%')
               AND ($2::text IS NULL OR city_name ILIKE '%' || $2 || '%')
             ORDER BY published_at DESC NULLS LAST, id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter_term(&filter.timetable_mode_name))
            .bind(filter_term(&filter.city_name))
            .fetch_all(&self.pool)
            .await?;
        let listings = rows.iter().map(listing_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(listings)
    }

    async fn get(&self, id: i64) -> Result<Option<Listing>, PersistenceError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn get_by_external_id(&self, external_id: i64) -> Result<Option<Listing>, PersistenceError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn create(&self, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        insert_listing(&mut conn, payload).await
    }

    async fn update(&self, id: i64, payload: &ListingPayload) -> Result<Listing, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        update_listing(&mut conn, id, payload).await
    }

    async fn delete(&self, id: i64) -> Result<(), PersistenceError> {
        let result = sqlx::query("DELETE FROM listings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(id));
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}

/// One database transaction. Dropped without [`ListingSession::apply`] it rolls back.
pub struct PgListingSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ListingSession for PgListingSession {
    async fn find_by_external_ids(
        &mut self,
        external_ids: &[i64],
    ) -> Result<Vec<Listing>, PersistenceError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE external_id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(external_ids.to_vec())
            .fetch_all(&mut *self.tx)
            .await?;
        let listings = rows.iter().map(listing_from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(requested = external_ids.len(), found = listings.len(), "batched key lookup");
        Ok(listings)
    }

    async fn apply(self: Box<Self>, changes: ChangeSet) -> Result<usize, PersistenceError> {
        let mut tx = self.tx;
        for update in changes.updates.iter().filter(|u| !u.is_noop()) {
            update_listing(&mut tx, update.id(), &update.patched_payload()).await?;
        }
        for payload in &changes.creates {
            insert_listing(&mut tx, payload).await?;
        }
        tx.commit().await?;
        Ok(changes.creates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_filters_are_not_bound() {
        assert_eq!(filter_term(&None), None);
        assert_eq!(filter_term(&Some("   ".into())), None);
        assert_eq!(filter_term(&Some(" Moscow ".into())), Some("Moscow".into()));
    }

    #[test]
    fn write_statements_return_full_rows() {
        assert!(insert_sql().contains("RETURNING id, external_id"));
        assert!(update_sql().contains("WHERE id = $1"));
        assert!(update_sql().contains("updated_at = NOW()"));
    }
}
