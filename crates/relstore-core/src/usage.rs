//! # Usage Index
//!
//! Reverse reference counts: for a record, which other records hold it in
//! which relation field, and how many times.
//!
//! Relation lists may contain the same peer more than once (positional
//! writes allow duplicates), so entries are counts rather than flags.
//! Deletion walks this index to strip a record from every referencer.

use crate::{FieldId, LocalId};
use std::collections::BTreeMap;

/// Per-record reverse index: referencer → field → occurrences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageIndex {
    entries: BTreeMap<LocalId, BTreeMap<FieldId, usize>>,
}

impl UsageIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more occurrence of this record in `owner.field`.
    pub fn add(&mut self, owner: LocalId, field: FieldId) {
        *self
            .entries
            .entry(owner)
            .or_default()
            .entry(field)
            .or_insert(0) += 1;
    }

    /// Count one occurrence less. Returns false if none was recorded.
    pub fn remove(&mut self, owner: LocalId, field: FieldId) -> bool {
        let Some(fields) = self.entries.get_mut(&owner) else {
            return false;
        };
        let Some(count) = fields.get_mut(&field) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            fields.remove(&field);
            if fields.is_empty() {
                self.entries.remove(&owner);
            }
        }
        true
    }

    /// Overwrite the count for `owner.field`; zero drops the entry.
    pub fn set(&mut self, owner: LocalId, field: FieldId, count: usize) {
        if count == 0 {
            if let Some(fields) = self.entries.get_mut(&owner) {
                fields.remove(&field);
                if fields.is_empty() {
                    self.entries.remove(&owner);
                }
            }
            return;
        }
        self.entries.entry(owner).or_default().insert(field, count);
    }

    /// Drop everything recorded for `owner`.
    pub fn forget(&mut self, owner: LocalId) {
        self.entries.remove(&owner);
    }

    #[must_use]
    pub fn count(&self, owner: LocalId, field: FieldId) -> usize {
        self.entries
            .get(&owner)
            .and_then(|fields| fields.get(&field))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_used_by(&self, owner: LocalId) -> bool {
        self.entries.contains_key(&owner)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every `(referencer, field, count)` triple, ordered by referencer.
    pub fn entries(&self) -> impl Iterator<Item = (LocalId, FieldId, usize)> + '_ {
        self.entries.iter().flat_map(|(owner, fields)| {
            fields
                .iter()
                .map(move |(field, count)| (*owner, *field, *count))
        })
    }

    /// Every `(referencer, field)` pair.
    pub fn pairs(&self) -> impl Iterator<Item = (LocalId, FieldId)> + '_ {
        self.entries().map(|(owner, field, _)| (owner, field))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
