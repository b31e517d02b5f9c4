//! # Dependency Tracking
//!
//! Explicit replacement for ambient reactive observation.
//!
//! Compute functions, sort comparators and hooks receive a [`Ctx`]. Every
//! field read while a computation runs is recorded in the innermost frame;
//! when the computation ends those reads become its sources. A later write
//! to any source reacts:
//! - `Compute` dependents are flagged stale, and recomputed within the drain
//!   when eager, observed externally, or themselves read by a computation;
//!   otherwise on next read.
//! - `Sort` dependents enqueue a re-sort.

use crate::record::FieldValue;
use crate::schema::{Computed, FieldKind, FieldOrder};
use crate::store::Store;
use crate::types::FieldKey;
use crate::{FieldId, LocalId, StoreError};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Reaction {
    Compute,
    Sort,
}

/// A computation that depends on fields.
pub(crate) type Dependent = (FieldKey, Reaction);

#[derive(Debug, Default)]
pub(crate) struct Tracker {
    frames: Vec<BTreeSet<FieldKey>>,
    subscribers: BTreeMap<FieldKey, BTreeSet<Dependent>>,
    sources: BTreeMap<Dependent, BTreeSet<FieldKey>>,
    observed: BTreeMap<FieldKey, usize>,
    changed: BTreeSet<FieldKey>,
}

fn remap(key: FieldKey, from: LocalId, to: LocalId) -> FieldKey {
    if key.0 == from { (to, key.1) } else { key }
}

impl Tracker {
    pub(crate) fn begin(&mut self) {
        self.frames.push(BTreeSet::new());
    }

    pub(crate) fn end(&mut self) -> BTreeSet<FieldKey> {
        self.frames.pop().unwrap_or_default()
    }

    pub(crate) fn record_read(&mut self, key: FieldKey) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(key);
        }
    }

    fn unsubscribe(&mut self, dependent: Dependent) {
        let Some(sources) = self.sources.remove(&dependent) else {
            return;
        };
        for source in sources {
            if let Some(subs) = self.subscribers.get_mut(&source) {
                subs.remove(&dependent);
                if subs.is_empty() {
                    self.subscribers.remove(&source);
                }
            }
        }
    }

    /// Replace the sources of `dependent`.
    pub(crate) fn subscribe(&mut self, dependent: Dependent, mut reads: BTreeSet<FieldKey>) {
        self.unsubscribe(dependent);
        reads.remove(&dependent.0);
        for source in &reads {
            self.subscribers
                .entry(*source)
                .or_default()
                .insert(dependent);
        }
        if !reads.is_empty() {
            self.sources.insert(dependent, reads);
        }
    }

    pub(crate) fn dependents(&self, key: FieldKey) -> Vec<Dependent> {
        self.subscribers
            .get(&key)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Something outside the field's own record wants it fresh.
    pub(crate) fn is_demanded(&self, key: FieldKey) -> bool {
        self.observed.contains_key(&key) || self.subscribers.contains_key(&key)
    }

    pub(crate) fn observe(&mut self, key: FieldKey) {
        *self.observed.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn unobserve(&mut self, key: FieldKey) -> bool {
        let Some(count) = self.observed.get_mut(&key) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.observed.remove(&key);
        }
        true
    }

    pub(crate) fn mark_changed(&mut self, key: FieldKey) {
        if self.observed.contains_key(&key) {
            self.changed.insert(key);
        }
    }

    pub(crate) fn take_changes(&mut self) -> BTreeSet<FieldKey> {
        std::mem::take(&mut self.changed)
    }

    /// Move everything recorded for `from` onto `to`.
    pub(crate) fn rekey(&mut self, from: LocalId, to: LocalId) {
        let subscribers = std::mem::take(&mut self.subscribers);
        for (source, subs) in subscribers {
            self.subscribers
                .entry(remap(source, from, to))
                .or_default()
                .extend(subs.into_iter().map(|(key, r)| (remap(key, from, to), r)));
        }
        let sources = std::mem::take(&mut self.sources);
        for ((key, reaction), reads) in sources {
            self.sources
                .entry((remap(key, from, to), reaction))
                .or_default()
                .extend(reads.into_iter().map(|read| remap(read, from, to)));
        }
        let observed = std::mem::take(&mut self.observed);
        for (key, count) in observed {
            *self.observed.entry(remap(key, from, to)).or_insert(0) += count;
        }
        self.changed = std::mem::take(&mut self.changed)
            .into_iter()
            .map(|key| remap(key, from, to))
            .collect();
        for frame in &mut self.frames {
            *frame = std::mem::take(frame)
                .into_iter()
                .map(|key| remap(key, from, to))
                .collect();
        }
    }

    /// Drop all subscriptions of and on the given ids.
    pub(crate) fn forget(&mut self, ids: &[LocalId]) {
        let doomed = |key: &FieldKey| ids.contains(&key.0);
        let dead: Vec<Dependent> = self
            .sources
            .keys()
            .filter(|(key, _)| doomed(key))
            .copied()
            .collect();
        for dependent in dead {
            self.unsubscribe(dependent);
        }
        self.subscribers.retain(|key, _| !doomed(key));
        for reads in self.sources.values_mut() {
            reads.retain(|key| !doomed(key));
        }
        self.sources.retain(|_, reads| !reads.is_empty());
        self.observed.retain(|key, _| !doomed(key));
        self.changed.retain(|key| !doomed(key));
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Handle passed to compute functions, comparators and hooks.
///
/// Reads through the context (or through [`Ctx::store`]) are recorded as
/// dependencies of the running computation.
#[derive(Debug)]
pub struct Ctx<'a> {
    store: &'a mut Store,
    record: LocalId,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(store: &'a mut Store, record: LocalId) -> Self {
        Self { store, record }
    }

    /// The record the computation or hook runs for.
    #[must_use]
    pub fn record(&self) -> LocalId {
        self.store.canonical(self.record).unwrap_or(self.record)
    }

    /// Attribute of the current record.
    pub fn get(&mut self, field: &str) -> Result<Value, StoreError> {
        self.store.value(self.record, field)
    }

    /// Attribute of another record.
    pub fn get_of(&mut self, id: LocalId, field: &str) -> Result<Value, StoreError> {
        self.store.value(id, field)
    }

    /// Members of a relation of the current record.
    pub fn records(&mut self, field: &str) -> Result<Vec<LocalId>, StoreError> {
        self.store.records(self.record, field)
    }

    pub fn records_of(&mut self, id: LocalId, field: &str) -> Result<Vec<LocalId>, StoreError> {
        self.store.records(id, field)
    }

    /// Occupant of a to-one relation of the current record.
    pub fn one(&mut self, field: &str) -> Result<Option<LocalId>, StoreError> {
        self.store.record(self.record, field)
    }

    pub fn one_of(&mut self, id: LocalId, field: &str) -> Result<Option<LocalId>, StoreError> {
        self.store.record(id, field)
    }

    /// Write through the normal update path; joins the running cycle.
    pub fn update(&mut self, id: LocalId, data: Value) -> Result<(), StoreError> {
        self.store.update(id, data)
    }

    pub fn insert(&mut self, model: &str, data: Value) -> Result<LocalId, StoreError> {
        self.store.insert(model, data)
    }

    pub fn store(&mut self) -> &mut Store {
        self.store
    }
}

/// Stable insertion sort with a fallible comparator.
fn sort_ids<F>(ids: Vec<LocalId>, mut cmp: F) -> Result<Vec<LocalId>, StoreError>
where
    F: FnMut(LocalId, LocalId) -> Result<Ordering, StoreError>,
{
    let mut sorted: Vec<LocalId> = Vec::with_capacity(ids.len());
    for id in ids {
        let mut at = sorted.len();
        while at > 0 && cmp(sorted[at - 1], id)? == Ordering::Greater {
            at -= 1;
        }
        sorted.insert(at, id);
    }
    Ok(sorted)
}

// =============================================================================
// REACTIONS
// =============================================================================

impl Store {
    /// A field was written: wake whatever read it.
    pub(crate) fn notify(&mut self, key: FieldKey) {
        self.tracker.mark_changed(key);
        for (dependent, reaction) in self.tracker.dependents(key) {
            match reaction {
                Reaction::Compute => self.invalidate(dependent),
                Reaction::Sort => {
                    self.queues.sort.push(dependent);
                }
            }
        }
    }

    /// Flag a derived field stale and schedule it when someone needs it.
    pub(crate) fn invalidate(&mut self, key: FieldKey) {
        let Some(id) = self.canonical(key.0) else {
            return;
        };
        let key = (id, key.1);
        let Some(slot) = self
            .records
            .get_mut(&id)
            .and_then(|record| record.fields.get_mut(key.1.index()))
        else {
            return;
        };
        if slot.computing {
            return;
        }
        slot.needs_compute = true;
        if self.schema.field(id.model, key.1).eager || self.tracker.is_demanded(key) {
            self.queues.compute.push(key);
        }
    }

    /// Recompute a stale derived field before it is read.
    pub(crate) fn ensure_fresh(&mut self, key: FieldKey) -> Result<(), StoreError> {
        let slot = self.slot(key.0, key.1)?;
        if slot.needs_compute && !slot.computing {
            self.with_update(|store| store.run_compute(key))?;
        }
        Ok(())
    }

    pub(crate) fn run_compute(&mut self, key: FieldKey) -> Result<(), StoreError> {
        let (id, field) = key;
        let Some(id) = self.canonical(id) else {
            return Ok(());
        };
        let schema = Arc::clone(&self.schema);
        let def = schema.field(id.model, field);
        let Some(compute) = def.compute.clone() else {
            return Ok(());
        };
        {
            let slot = self.slot_mut(id, field)?;
            if slot.computing || !slot.needs_compute {
                return Ok(());
            }
            slot.computing = true;
            slot.needs_compute = false;
        }

        self.tracker.begin();
        let result = compute(&mut Ctx::new(self, id));
        let reads = self.tracker.end();

        let Some(id) = self.canonical(id) else {
            return result.map(|_| ());
        };
        let failed = result.is_err();
        if let Ok(slot) = self.slot_mut(id, field) {
            slot.computing = false;
            // A failed run leaves the field stale so the next read retries.
            if failed {
                slot.needs_compute = true;
            }
        }
        self.tracker.subscribe(((id, field), Reaction::Compute), reads);
        trace!(record = %self.describe(id), field = %def.name, "computed field");

        match result? {
            Computed::Value(value) if def.kind == FieldKind::Attr => {
                self.write_attr(id, field, value, true).map(|_| ())
            }
            Computed::Records(ids) if def.kind.is_relation() => {
                self.assign_ids(id, field, &ids)
            }
            _ => Err(StoreError::FieldKind {
                model: schema.model(id.model).name().to_string(),
                field: def.name.clone(),
                expected: def.kind.label(),
                actual: "a computed value of the other kind",
            }),
        }
    }

    /// Re-order a relation with its record comparator.
    pub(crate) fn sort_relation(&mut self, key: FieldKey) -> Result<(), StoreError> {
        let (owner, field) = key;
        let Some(owner) = self.canonical(owner) else {
            return Ok(());
        };
        let schema = Arc::clone(&self.schema);
        let Some(FieldOrder::Records(order)) = schema.field(owner.model, field).order.clone()
        else {
            return Ok(());
        };
        let ids: Vec<LocalId> = self.list(owner, field)?.iter().collect();
        if ids.len() < 2 {
            return Ok(());
        }

        self.tracker.begin();
        let sorted = {
            let mut ctx = Ctx::new(self, owner);
            sort_ids(ids.clone(), |a, b| order(&mut ctx, a, b))
        };
        let reads = self.tracker.end();
        self.tracker.subscribe(((owner, field), Reaction::Sort), reads);

        let sorted = sorted?;
        if sorted != ids {
            self.list_mut(owner, field)?.replace(sorted);
            let stamp = self.tick(owner.model, field);
            self.slot_mut(owner, field)?.written_at = stamp;
            self.field_changed(owner, field);
        }
        Ok(())
    }

    /// Read an attribute, recording the read.
    pub(crate) fn read_attr(&mut self, id: LocalId, field: FieldId) -> Result<Value, StoreError> {
        let id = self.require(id)?;
        self.ensure_fresh((id, field))?;
        let id = self.require(id)?;
        self.tracker.record_read((id, field));
        match &self.slot(id, field)?.value {
            FieldValue::Attr(value) => Ok(value.clone()),
            FieldValue::Relation(_) => Err(self.kind_mismatch(id, field, FieldKind::Attr)),
        }
    }

    /// Read relation members, recording the read.
    pub(crate) fn read_list(
        &mut self,
        id: LocalId,
        field: FieldId,
    ) -> Result<Vec<LocalId>, StoreError> {
        let id = self.require(id)?;
        self.ensure_fresh((id, field))?;
        let id = self.require(id)?;
        self.tracker.record_read((id, field));
        match &self.slot(id, field)?.value {
            FieldValue::Relation(list) => Ok(list.iter().collect()),
            FieldValue::Attr(_) => Err(self.kind_mismatch(id, field, FieldKind::Many)),
        }
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    /// Keep `id.field` fresh eagerly and report its changes through
    /// [`Store::take_changes`]. Observations nest.
    pub fn observe(&mut self, id: LocalId, field: &str) -> Result<(), StoreError> {
        let id = self.require(id)?;
        let field = self.schema.model(id.model).field_id(field)?;
        self.tracker.observe((id, field));
        self.ensure_fresh((id, field))
    }

    /// Release one observation. Returns false if none was held.
    pub fn unobserve(&mut self, id: LocalId, field: &str) -> Result<bool, StoreError> {
        let id = self.require(id)?;
        let field = self.schema.model(id.model).field_id(field)?;
        Ok(self.tracker.unobserve((id, field)))
    }

    /// Observed fields written since the last call, as `(record, field)`.
    pub fn take_changes(&mut self) -> Vec<(LocalId, String)> {
        self.tracker
            .take_changes()
            .into_iter()
            .map(|(id, field)| {
                let name = self.schema.field(id.model, field).name.clone();
                (self.canonical(id).unwrap_or(id), name)
            })
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
