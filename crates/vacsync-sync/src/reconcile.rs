//! Create-vs-update decisions for one batch. Pure: no I/O happens here.

use std::collections::{HashMap, HashSet};

use vacsync_core::{ChangeSet, Listing, ListingPayload, ListingUpdate};

/// Distinct non-null external ids of a batch, in first-seen order.
pub fn distinct_external_ids(batch: &[ListingPayload]) -> Vec<i64> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter_map(|p| p.external_id)
        .filter(|key| seen.insert(*key))
        .collect()
}

/// Decides, per payload in batch order, whether it updates an existing listing or creates one.
///
/// `existing` is the result of the batched lookup for [`distinct_external_ids`]. A key that
/// repeats within the batch yields a single decision whose fields come from its last
/// occurrence. Payloads without an external id are always created.
pub fn reconcile(batch: Vec<ListingPayload>, existing: Vec<Listing>) -> ChangeSet {
    let mut known: HashMap<i64, Listing> = existing
        .into_iter()
        .filter_map(|listing| listing.external_id.map(|key| (key, listing)))
        .collect();
    let mut update_slots: HashMap<i64, usize> = HashMap::new();
    let mut create_slots: HashMap<i64, usize> = HashMap::new();
    let mut changes = ChangeSet::default();

    for payload in batch {
        let Some(key) = payload.external_id else {
            changes.creates.push(payload);
            continue;
        };

        if let Some(&slot) = update_slots.get(&key) {
            changes.updates[slot].patch = payload.fields;
        } else if let Some(current) = known.remove(&key) {
            update_slots.insert(key, changes.updates.len());
            changes.updates.push(ListingUpdate {
                current,
                patch: payload.fields,
            });
        } else if let Some(&slot) = create_slots.get(&key) {
            changes.creates[slot] = payload;
        } else {
            create_slots.insert(key, changes.creates.len());
            changes.creates.push(payload);
        }
    }

    changes
}
