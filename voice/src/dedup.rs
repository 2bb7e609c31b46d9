//! Duplicate dispatch suppression.

use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

/// Maximum remembered query ids per session
const DEDUP_MAX_ENTRIES: usize = 2000;

/// Derive the id of a query: hash of the normalized text and the submission time
pub fn query_id(query: &str, submitted_at_ms: i64) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b":");
    hasher.update(submitted_at_ms.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Set of query ids already dispatched in this session.
///
/// Bounded: once full, the oldest id is forgotten first.
#[derive(Debug)]
pub struct DispatchDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    max_entries: usize,
}

impl Default for DispatchDedup {
    fn default() -> Self {
        Self::with_capacity(DEDUP_MAX_ENTRIES)
    }
}

impl DispatchDedup {
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Record `id`. Returns `true` on first sight, `false` for a duplicate.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
