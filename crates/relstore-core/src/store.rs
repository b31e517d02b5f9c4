//! # Store & Update Cycle
//!
//! The single owner of all records, indices and pending work.
//!
//! Every mutation runs inside [`Store::with_update`]. Nested calls only bump
//! a depth counter; when the outermost call returns, the store drains its
//! queues in fixed priority order until none has work left:
//!
//! | Priority | Queue | Job |
//! |---|---|---|
//! | 1 | compute | recompute a stale derived field |
//! | 2 | sort | re-order a relation with its comparator |
//! | 3 | on-add | hook per added peer |
//! | 4 | on-delete | hook per removed peer |
//! | 5 | on-update | hook per changed field |
//! | 6 | on-change | model listener per record |
//! | 7 | delete | physical removal of a deleted record |
//!
//! Each step restarts from the highest priority, so work produced by a hook
//! joins the same drain. Hook jobs fire at most once per cycle.

use crate::primitives::{MAX_DRAIN_STEPS, MAX_IDENTITY_CANDIDATES};
use crate::record::{Record, RecordField};
use crate::relation::{RelationList, RelationMut};
use crate::schema::{FieldKind, Schema, SchemaBuilder};
use crate::tracking::{Ctx, Tracker};
use crate::types::FieldKey;
use crate::{FieldId, InsertOptions, Inserted, LocalId, ModelId, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{trace, warn};

// =============================================================================
// OPTIONS
// =============================================================================

/// Tunable limits of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Cap on identity keys enumerated per record or lookup.
    pub max_identity_candidates: usize,
    /// Cap on jobs processed by one drain.
    pub max_drain_steps: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_identity_candidates: MAX_IDENTITY_CANDIDATES,
            max_drain_steps: MAX_DRAIN_STEPS,
        }
    }
}

// =============================================================================
// QUEUES
// =============================================================================

/// FIFO of deduplicated jobs.
///
/// A `once` queue remembers popped jobs until the cycle ends, so the same
/// job cannot run twice in one cycle.
#[derive(Debug)]
pub(crate) struct JobQueue<T> {
    order: VecDeque<T>,
    seen: BTreeSet<T>,
    once: bool,
}

impl<T: Ord + Copy> JobQueue<T> {
    fn new(once: bool) -> Self {
        Self {
            order: VecDeque::new(),
            seen: BTreeSet::new(),
            once,
        }
    }

    pub(crate) fn push(&mut self, job: T) -> bool {
        if !self.seen.insert(job) {
            return false;
        }
        self.order.push_back(job);
        true
    }

    fn pop(&mut self) -> Option<T> {
        let job = self.order.pop_front()?;
        if !self.once {
            self.seen.remove(&job);
        }
        Some(job)
    }

    fn end_cycle(&mut self) {
        self.seen = self.order.iter().copied().collect();
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// `(owner, field, peer)` of an add/delete hook.
pub(crate) type PeerJob = (LocalId, FieldId, LocalId);

#[derive(Debug)]
pub(crate) struct Queues {
    pub(crate) compute: JobQueue<FieldKey>,
    pub(crate) sort: JobQueue<FieldKey>,
    pub(crate) on_add: JobQueue<PeerJob>,
    pub(crate) on_delete: JobQueue<PeerJob>,
    pub(crate) on_update: JobQueue<FieldKey>,
    pub(crate) on_change: JobQueue<(LocalId, usize)>,
    pub(crate) delete: JobQueue<LocalId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Compute(FieldKey),
    Sort(FieldKey),
    Added(PeerJob),
    Removed(PeerJob),
    Updated(FieldKey),
    Changed(LocalId, usize),
    Finalize(LocalId),
}

impl Queues {
    fn new() -> Self {
        Self {
            compute: JobQueue::new(false),
            sort: JobQueue::new(false),
            on_add: JobQueue::new(true),
            on_delete: JobQueue::new(true),
            on_update: JobQueue::new(true),
            on_change: JobQueue::new(true),
            delete: JobQueue::new(false),
        }
    }

    fn next(&mut self) -> Option<Job> {
        self.compute
            .pop()
            .map(Job::Compute)
            .or_else(|| self.sort.pop().map(Job::Sort))
            .or_else(|| self.on_add.pop().map(Job::Added))
            .or_else(|| self.on_delete.pop().map(Job::Removed))
            .or_else(|| self.on_update.pop().map(Job::Updated))
            .or_else(|| self.on_change.pop().map(|(id, l)| Job::Changed(id, l)))
            .or_else(|| self.delete.pop().map(Job::Finalize))
    }

    fn end_cycle(&mut self) {
        self.compute.end_cycle();
        self.sort.end_cycle();
        self.on_add.end_cycle();
        self.on_delete.end_cycle();
        self.on_update.end_cycle();
        self.on_change.end_cycle();
        self.delete.end_cycle();
    }

    fn clear(&mut self) {
        self.compute.clear();
        self.sort.clear();
        self.on_add.clear();
        self.on_delete.clear();
        self.on_update.clear();
        self.on_change.clear();
        self.delete.clear();
    }

    fn is_empty(&self) -> bool {
        self.compute.is_empty()
            && self.sort.is_empty()
            && self.on_add.is_empty()
            && self.on_delete.is_empty()
            && self.on_update.is_empty()
            && self.on_change.is_empty()
            && self.delete.is_empty()
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Per-model local-id table.
#[derive(Debug)]
pub(crate) struct ModelTable {
    pub(crate) next_seq: u64,
    /// Canonical ids of live records.
    pub(crate) members: BTreeSet<LocalId>,
    /// Write clock per field definition.
    pub(crate) clocks: Vec<u64>,
}

impl ModelTable {
    fn new(fields: usize) -> Self {
        Self {
            next_seq: 0,
            members: BTreeSet::new(),
            clocks: vec![0; fields],
        }
    }
}

/// The reactive record store.
#[derive(Debug)]
pub struct Store {
    pub(crate) schema: Arc<Schema>,
    pub(crate) options: StoreOptions,
    pub(crate) tables: Vec<ModelTable>,
    /// Live records by canonical id.
    pub(crate) records: BTreeMap<LocalId, Record>,
    /// Every local id of a live record → its canonical id.
    pub(crate) aliases: BTreeMap<LocalId, LocalId>,
    pub(crate) object_index: BTreeMap<String, LocalId>,
    pub(crate) depth: usize,
    pub(crate) draining: bool,
    pub(crate) queues: Queues,
    pub(crate) tracker: Tracker,
    pub(crate) reconciling: BTreeSet<(LocalId, LocalId)>,
}

impl Store {
    /// Start declaring models.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub(crate) fn new(schema: Schema, options: StoreOptions) -> Self {
        let mut tables = Vec::with_capacity(schema.model_count());
        for model in schema.models() {
            tables.push(ModelTable::new(model.fields().count()));
        }
        Self {
            schema: Arc::new(schema),
            options,
            tables,
            records: BTreeMap::new(),
            aliases: BTreeMap::new(),
            object_index: BTreeMap::new(),
            depth: 0,
            draining: false,
            queues: Queues::new(),
            tracker: Tracker::default(),
            reconciling: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Whether an update cycle is open or draining.
    #[must_use]
    pub fn in_update(&self) -> bool {
        self.depth > 0 || self.draining
    }

    // =========================================================================
    // UPDATE CYCLE
    // =========================================================================

    /// Run `f` as part of an update cycle.
    ///
    /// The outermost call drains all queued work before returning, also when
    /// `f` failed; `f`'s error is then returned.
    pub fn with_update<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Self) -> Result<T, StoreError>,
    {
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        if self.depth > 0 || self.draining {
            return result;
        }
        let drained = self.drain();
        let value = result?;
        drained?;
        Ok(value)
    }

    fn drain(&mut self) -> Result<(), StoreError> {
        self.draining = true;
        let result = self.drain_queues();
        self.draining = false;
        if result.is_err() {
            self.queues.clear();
        }
        self.queues.end_cycle();
        result
    }

    fn drain_queues(&mut self) -> Result<(), StoreError> {
        let limit = self.options.max_drain_steps;
        let mut steps = 0usize;
        while let Some(job) = self.queues.next() {
            steps += 1;
            if steps > limit {
                warn!(limit, "update cycle did not settle");
                return Err(StoreError::DrainOverflow(limit));
            }
            trace!(?job, "drain step");
            self.run_job(job)?;
        }
        debug_assert!(self.queues.is_empty());
        Ok(())
    }

    fn run_job(&mut self, job: Job) -> Result<(), StoreError> {
        let schema = Arc::clone(&self.schema);
        match job {
            Job::Compute(key) => self.run_compute(key),
            Job::Sort(key) => self.sort_relation(key),
            Job::Added((owner, field, peer)) => {
                let Some(owner) = self.canonical(owner) else {
                    return Ok(());
                };
                let Some(hook) = schema.field(owner.model, field).on_add.clone() else {
                    return Ok(());
                };
                let peer = self.canonical(peer).unwrap_or(peer);
                hook(&mut Ctx::new(self, owner), peer)
            }
            Job::Removed((owner, field, peer)) => {
                let Some(owner) = self.canonical(owner) else {
                    return Ok(());
                };
                let Some(hook) = schema.field(owner.model, field).on_delete.clone() else {
                    return Ok(());
                };
                let peer = self.canonical(peer).unwrap_or(peer);
                hook(&mut Ctx::new(self, owner), peer)
            }
            Job::Updated((owner, field)) => {
                let Some(owner) = self.canonical(owner) else {
                    return Ok(());
                };
                let Some(hook) = schema.field(owner.model, field).on_update.clone() else {
                    return Ok(());
                };
                hook(&mut Ctx::new(self, owner))
            }
            Job::Changed(owner, listener) => {
                let Some(owner) = self.canonical(owner) else {
                    return Ok(());
                };
                let Some(handler) = schema
                    .model(owner.model)
                    .listeners
                    .get(listener)
                    .map(|l| Arc::clone(&l.handler))
                else {
                    return Ok(());
                };
                handler(&mut Ctx::new(self, owner))
            }
            Job::Finalize(id) => self.finalize_delete(id),
        }
    }

    /// Queue hooks and wake dependents after `owner.field` changed.
    pub(crate) fn field_changed(&mut self, owner: LocalId, field: FieldId) {
        self.notify((owner, field));
        let schema = Arc::clone(&self.schema);
        let model = schema.model(owner.model);
        if model.field_def(field).on_update.is_some() {
            self.queues.on_update.push((owner, field));
        }
        for listener in model.listeners_of(field) {
            self.queues.on_change.push((owner, listener));
        }
    }

    /// Advance the write clock of a field definition.
    pub(crate) fn tick(&mut self, model: ModelId, field: FieldId) -> u64 {
        match self.tables[model.index()].clocks.get_mut(field.index()) {
            Some(clock) => {
                *clock += 1;
                *clock
            }
            None => 0,
        }
    }

    // =========================================================================
    // INTERNAL LOOKUPS
    // =========================================================================

    /// Canonical id of the live record `id` belongs to.
    #[must_use]
    pub fn canonical(&self, id: LocalId) -> Option<LocalId> {
        self.aliases.get(&id).copied()
    }

    pub(crate) fn require(&self, id: LocalId) -> Result<LocalId, StoreError> {
        self.canonical(id).ok_or(StoreError::RecordNotFound(id))
    }

    pub(crate) fn record_ref(&self, id: LocalId) -> Result<&Record, StoreError> {
        let canonical = self.require(id)?;
        self.records
            .get(&canonical)
            .ok_or(StoreError::RecordNotFound(id))
    }

    pub(crate) fn record_mut(&mut self, id: LocalId) -> Result<&mut Record, StoreError> {
        let canonical = self.require(id)?;
        self.records
            .get_mut(&canonical)
            .ok_or(StoreError::RecordNotFound(id))
    }

    fn unknown_field(&self, model: ModelId, field: FieldId) -> StoreError {
        StoreError::UnknownField {
            model: self.schema.model(model).name().to_string(),
            field: format!("#{}", field.0),
        }
    }

    pub(crate) fn slot(&self, id: LocalId, field: FieldId) -> Result<&RecordField, StoreError> {
        self.record_ref(id)?
            .fields
            .get(field.index())
            .ok_or_else(|| self.unknown_field(id.model, field))
    }

    pub(crate) fn slot_mut(
        &mut self,
        id: LocalId,
        field: FieldId,
    ) -> Result<&mut RecordField, StoreError> {
        let missing = self.unknown_field(id.model, field);
        self.record_mut(id)?
            .fields
            .get_mut(field.index())
            .ok_or(missing)
    }

    pub(crate) fn kind_mismatch(
        &self,
        id: LocalId,
        field: FieldId,
        expected: FieldKind,
    ) -> StoreError {
        let def = self.schema.field(id.model, field);
        StoreError::FieldKind {
            model: self.schema.model(id.model).name().to_string(),
            field: def.name.clone(),
            expected: expected.label(),
            actual: def.kind.label(),
        }
    }

    pub(crate) fn list(&self, owner: LocalId, field: FieldId) -> Result<&RelationList, StoreError> {
        self.record_ref(owner)?
            .list(field)
            .ok_or_else(|| self.kind_mismatch(owner, field, FieldKind::Many))
    }

    pub(crate) fn list_mut(
        &mut self,
        owner: LocalId,
        field: FieldId,
    ) -> Result<&mut RelationList, StoreError> {
        let mismatch = self.kind_mismatch(owner, field, FieldKind::Many);
        self.record_mut(owner)?.list_mut(field).ok_or(mismatch)
    }

    pub(crate) fn contains(&self, owner: LocalId, field: FieldId, peer: LocalId) -> bool {
        self.list(owner, field)
            .is_ok_and(|list| list.contains(peer))
    }

    fn field_of(&self, id: LocalId, name: &str) -> Result<(LocalId, FieldId), StoreError> {
        let id = self.require(id)?;
        let field = self.schema.model(id.model).field_id(name)?;
        Ok((id, field))
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Get-or-create a record from `data` and write all of it.
    ///
    /// `data` is an object, or shorthand for the model's single identifying
    /// field. Arrays are rejected; use `insert_many` or `insert_with`.
    /// Markup is escaped.
    pub fn insert(&mut self, model: &str, data: Value) -> Result<LocalId, StoreError> {
        let model = self.schema.model_id(model)?;
        let id = self.with_update(|store| store.insert_in_cycle(model, &data, false))?;
        Ok(self.canonical(id).unwrap_or(id))
    }

    /// Insert several records in one cycle, in order.
    pub fn insert_many(&mut self, model: &str, items: Vec<Value>) -> Result<Vec<LocalId>, StoreError> {
        Ok(self
            .insert_with(model, Value::Array(items), InsertOptions::default())?
            .ids())
    }

    /// Insert an object or an array of objects with explicit options.
    pub fn insert_with(
        &mut self,
        model: &str,
        data: Value,
        options: InsertOptions,
    ) -> Result<Inserted, StoreError> {
        let model = self.schema.model_id(model)?;
        let trusted = options.trusted;
        let inserted = self.with_update(|store| match &data {
            Value::Array(items) => items
                .iter()
                .map(|item| store.insert_in_cycle(model, item, trusted))
                .collect::<Result<Vec<_>, _>>()
                .map(Inserted::Many),
            item => store.insert_in_cycle(model, item, trusted).map(Inserted::One),
        })?;
        Ok(match inserted {
            Inserted::One(id) => Inserted::One(self.canonical(id).unwrap_or(id)),
            Inserted::Many(ids) => Inserted::Many(
                ids.into_iter()
                    .map(|id| self.canonical(id).unwrap_or(id))
                    .collect(),
            ),
        })
    }

    fn insert_in_cycle(
        &mut self,
        model: ModelId,
        data: &Value,
        trusted: bool,
    ) -> Result<LocalId, StoreError> {
        let id = self.preinsert(model, data, trusted)?;
        self.update_inner(id, data, trusted)?;
        self.require(id)
    }

    /// Write `data` into an existing record. Unknown keys are skipped.
    pub fn update(&mut self, id: LocalId, data: Value) -> Result<(), StoreError> {
        self.update_with(id, data, InsertOptions::default())
    }

    pub fn update_with(
        &mut self,
        id: LocalId,
        data: Value,
        options: InsertOptions,
    ) -> Result<(), StoreError> {
        self.with_update(|store| store.update_inner(id, &data, options.trusted))
    }

    /// Queue a record for removal at the end of the cycle.
    pub fn delete(&mut self, id: LocalId) -> Result<(), StoreError> {
        self.with_update(|store| {
            let id = store.require(id)?;
            store.record_mut(id)?.deleting = true;
            store.queues.delete.push(id);
            Ok(())
        })
    }

    /// Mutable view of a relation field.
    pub fn relation(&mut self, id: LocalId, field: &str) -> Result<RelationMut<'_>, StoreError> {
        let (id, field) = self.field_of(id, field)?;
        if !self.schema.field(id.model, field).kind.is_relation() {
            return Err(self.kind_mismatch(id, field, FieldKind::Many));
        }
        Ok(RelationMut::new(self, id, field))
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Record identified by `data`, if one exists.
    pub fn get(&self, model: &str, data: Value) -> Result<Option<LocalId>, StoreError> {
        let model = self.schema.model_id(model)?;
        self.resolve(model, &data, false)
    }

    /// Two handles are equal iff they share a local id.
    #[must_use]
    pub fn eq(&self, a: LocalId, b: LocalId) -> bool {
        a == b
            || matches!(
                (self.canonical(a), self.canonical(b)),
                (Some(x), Some(y)) if x == y
            )
    }

    #[must_use]
    pub fn exists(&self, id: LocalId) -> bool {
        self.canonical(id).is_some()
    }

    /// All local ids of the record, canonical first.
    pub fn local_ids(&self, id: LocalId) -> Result<Vec<LocalId>, StoreError> {
        Ok(self.record_ref(id)?.ids.clone())
    }

    /// Registered object ids of the record, sorted.
    pub fn object_ids(&self, id: LocalId) -> Result<Vec<String>, StoreError> {
        Ok(self.record_ref(id)?.object_ids.iter().cloned().collect())
    }

    /// Who references the record: `(referencer, field name, count)`.
    pub fn usages(&self, id: LocalId) -> Result<Vec<(LocalId, String, usize)>, StoreError> {
        Ok(self
            .record_ref(id)?
            .usage
            .entries()
            .map(|(owner, field, count)| {
                let name = self.schema.field(owner.model, field).name.clone();
                (owner, name, count)
            })
            .collect())
    }

    /// Canonical ids of the live records of a model, in creation order.
    pub fn all(&self, model: &str) -> Result<Vec<LocalId>, StoreError> {
        let model = self.schema.model_id(model)?;
        Ok(self.tables[model.index()].members.iter().copied().collect())
    }

    pub fn count(&self, model: &str) -> Result<usize, StoreError> {
        let model = self.schema.model_id(model)?;
        Ok(self.tables[model.index()].members.len())
    }

    /// Attribute value. Stale derived values are recomputed first.
    pub fn value(&mut self, id: LocalId, field: &str) -> Result<Value, StoreError> {
        let (id, field) = self.field_of(id, field)?;
        self.read_attr(id, field)
    }

    /// Members of a relation.
    pub fn records(&mut self, id: LocalId, field: &str) -> Result<Vec<LocalId>, StoreError> {
        let (id, field) = self.field_of(id, field)?;
        self.read_list(id, field)
    }

    /// First member of a relation; the occupant of a to-one relation.
    pub fn record(&mut self, id: LocalId, field: &str) -> Result<Option<LocalId>, StoreError> {
        Ok(self.records(id, field)?.first().copied())
    }
}

// =============================================================================
// TESTS
// =============================================================================
