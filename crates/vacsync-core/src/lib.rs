//! Core domain model for vacsync.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{AppConfig, ConfigError};

pub const CRATE_NAME: &str = "vacsync-core";

/// Attribute fields of a listing, as supplied by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingFields {
    pub title: String,
    #[serde(default)]
    pub timetable_mode_name: Option<String>,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_remote_available: bool,
    #[serde(default)]
    pub is_hot: bool,
}

/// Normalized handoff contract from source clients into the sync pipeline.
///
/// Also the request body for explicit create/update calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingPayload {
    #[serde(default)]
    pub external_id: Option<i64>,
    #[serde(flatten)]
    pub fields: ListingFields,
}

impl ListingPayload {
    pub fn new(external_id: Option<i64>, title: impl Into<String>) -> Self {
        Self {
            external_id,
            fields: ListingFields {
                title: title.into(),
                ..ListingFields::default()
            },
        }
    }

    pub fn keyed(external_id: i64, title: impl Into<String>) -> Self {
        Self::new(Some(external_id), title)
    }

    pub fn unkeyed(title: impl Into<String>) -> Self {
        Self::new(None, title)
    }
}

/// Persisted listing. `id` is the storage-assigned surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub external_id: Option<i64>,
    #[serde(flatten)]
    pub fields: ListingFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    /// Payload view of this listing, e.g. to compare against an incoming item.
    pub fn to_payload(&self) -> ListingPayload {
        ListingPayload {
            external_id: self.external_id,
            fields: self.fields.clone(),
        }
    }
}

/// In-place overwrite of a persisted listing with fresh source fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingUpdate {
    pub current: Listing,
    pub patch: ListingFields,
}

impl ListingUpdate {
    pub fn id(&self) -> i64 {
        self.current.id
    }

    /// The row as it will be stored: same natural key, patched fields.
    pub fn patched_payload(&self) -> ListingPayload {
        ListingPayload {
            external_id: self.current.external_id,
            fields: self.patch.clone(),
        }
    }

    /// True when the patch would not change any stored field.
    pub fn is_noop(&self) -> bool {
        self.current.fields == self.patch
    }
}

/// Reconciliation decisions for one batch, applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub creates: Vec<ListingPayload>,
    pub updates: Vec<ListingUpdate>,
}

/// Query filters for listing reads. Both filters are case-insensitive substring matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    #[serde(default)]
    pub timetable_mode_name: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        contains_ignore_case(
            listing.fields.timetable_mode_name.as_deref(),
            self.timetable_mode_name.as_deref(),
        ) && contains_ignore_case(listing.fields.city_name.as_deref(), self.city_name.as_deref())
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: Option<&str>) -> bool {
    match needle.map(str::trim).filter(|n| !n.is_empty()) {
        None => true,
        Some(needle) => haystack
            .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
            .unwrap_or(false),
    }
}

/// Read ordering for listings: newest `published_at` first, unpublished last, then by id.
pub fn listing_read_order(a: &Listing, b: &Listing) -> Ordering {
    match (a.fields.published_at, b.fields.published_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(id: i64, city: Option<&str>, published_day: Option<u32>) -> Listing {
        let ts = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        Listing {
            id,
            external_id: Some(id * 10),
            fields: ListingFields {
                title: format!("listing {id}"),
                city_name: city.map(str::to_string),
                published_at: published_day
                    .map(|d| Utc.with_ymd_and_hms(2026, 3, d, 9, 0, 0).single().unwrap()),
                ..ListingFields::default()
            },
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn payload_deserializes_flat_json_with_null_key() {
        let payload: ListingPayload =
            serde_json::from_str(r#"{"external_id":null,"title":"X","is_hot":true}"#).unwrap();
        assert_eq!(payload.external_id, None);
        assert_eq!(payload.fields.title, "X");
        assert!(payload.fields.is_hot);
        assert!(!payload.fields.is_remote_available);
    }

    #[test]
    fn filter_is_case_insensitive_substring() {
        let l = listing(1, Some("Saint Petersburg"), None);
        let filter = ListingFilter {
            city_name: Some("petersburg".into()),
            ..ListingFilter::default()
        };
        assert!(filter.matches(&l));

        let miss = ListingFilter {
            city_name: Some("moscow".into()),
            ..ListingFilter::default()
        };
        assert!(!miss.matches(&l));
        assert!(!filter.matches(&listing(2, None, None)));
        assert!(ListingFilter::default().matches(&listing(3, None, None)));
    }

    #[test]
    fn read_order_puts_newest_first_and_unpublished_last() {
        let mut rows = vec![
            listing(1, None, None),
            listing(2, None, Some(1)),
            listing(3, None, Some(5)),
            listing(4, None, None),
        ];
        rows.sort_by(listing_read_order);
        let ids = rows.iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2, 1, 4]);
    }
}
