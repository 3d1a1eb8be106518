//! Visit queue ordering.
//!
//! The queue order is a projection computed from scratch on every read:
//! status first (`waiting < in_progress < done < canceled`), then triage
//! urgency descending, then arrival ascending. Token number and id break
//! any remaining ties so the order is total.

use std::cmp::{Ordering, Reverse};

use crate::models::QueueEntry;

/// Sort queue entries into display order
pub fn prioritize(mut entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    entries.sort_by(compare);
    entries
}

/// Total order over queue entries
pub fn compare(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}

fn sort_key(entry: &QueueEntry) -> (u8, Reverse<u8>, i64, i64, &str) {
    (
        entry.status.rank(),
        Reverse(entry.triage_level.weight()),
        entry.created_at,
        entry.token_number,
        entry.id.as_str(),
    )
}
