//! # Records
//!
//! One entity instance: its local ids, its registered object ids, one slot
//! per declared field and the usage index of everything pointing at it.
//!
//! Records live in the store's arena keyed by canonical local id. After a
//! reconciliation the absorbed ids stay valid as aliases of the survivor.

use crate::relation::RelationList;
use crate::schema::{FieldKind, FieldOrder, Model};
use crate::store::Store;
use crate::usage::UsageIndex;
use crate::{FieldId, LocalId, ModelId, StoreError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// STORAGE
// =============================================================================

/// Stored value of one field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Attr(Value),
    Relation(RelationList),
}

/// Per-record state of one field.
#[derive(Debug, Clone)]
pub(crate) struct RecordField {
    pub(crate) value: FieldValue,
    /// Clock value of the last write; 0 if never written.
    pub(crate) written_at: u64,
    pub(crate) needs_compute: bool,
    pub(crate) computing: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) ids: Vec<LocalId>,
    pub(crate) object_ids: BTreeSet<String>,
    pub(crate) fields: Vec<RecordField>,
    pub(crate) usage: UsageIndex,
    /// Queued for removal at the end of the cycle.
    pub(crate) deleting: bool,
}

impl Record {
    pub(crate) fn new(id: LocalId, model: &Model) -> Self {
        let fields = model
            .fields()
            .map(|def| RecordField {
                value: match def.kind {
                    FieldKind::Attr => FieldValue::Attr(def.default.clone()),
                    FieldKind::One | FieldKind::Many => FieldValue::Relation(RelationList::new()),
                },
                written_at: 0,
                needs_compute: def.compute.is_some(),
                computing: false,
            })
            .collect();
        Self {
            ids: vec![id],
            object_ids: BTreeSet::new(),
            fields,
            usage: UsageIndex::new(),
            deleting: false,
        }
    }

    pub(crate) fn attr(&self, field: FieldId) -> Option<&Value> {
        match &self.fields.get(field.index())?.value {
            FieldValue::Attr(value) => Some(value),
            FieldValue::Relation(_) => None,
        }
    }

    pub(crate) fn list(&self, field: FieldId) -> Option<&RelationList> {
        match &self.fields.get(field.index())?.value {
            FieldValue::Relation(list) => Some(list),
            FieldValue::Attr(_) => None,
        }
    }

    pub(crate) fn list_mut(&mut self, field: FieldId) -> Option<&mut RelationList> {
        match &mut self.fields.get_mut(field.index())?.value {
            FieldValue::Relation(list) => Some(list),
            FieldValue::Attr(_) => None,
        }
    }
}

/// HTML-escape every string in `value`.
pub(crate) fn escape_markup(value: &Value) -> Value {
    match value {
        Value::String(text) => {
            let mut out = String::with_capacity(text.len());
            for c in text.chars() {
                match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '"' => out.push_str("&quot;"),
                    '\'' => out.push_str("&#x27;"),
                    other => out.push(other),
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(escape_markup).collect()),
        other => other.clone(),
    }
}

// =============================================================================
// CREATION AND WRITES
// =============================================================================

impl Store {
    /// Resolve `data` to a live record, or create one.
    ///
    /// Only identifying fields are written here; the caller writes the rest.
    pub(crate) fn preinsert(
        &mut self,
        model: ModelId,
        data: &Value,
        trusted: bool,
    ) -> Result<LocalId, StoreError> {
        if let Some(found) = self.resolve(model, data, trusted)? {
            let record = self.record_mut(found)?;
            if record.deleting {
                record.deleting = false;
                debug!(record = %self.describe(found), "revived record queued for deletion");
            }
            return Ok(found);
        }
        self.create(model, data, trusted)
    }

    fn create(&mut self, model: ModelId, data: &Value, trusted: bool) -> Result<LocalId, StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.model(model);
        let data = self.data_object(model, data)?;

        let table = &mut self.tables[model.index()];
        table.next_seq += 1;
        let id = LocalId::new(model, table.next_seq);
        table.members.insert(id);
        self.records.insert(id, Record::new(id, def));
        self.aliases.insert(id, id);
        debug!(record = %self.describe(id), "created record");

        for field in def.field_ids() {
            if !def.is_identity_field(field) {
                continue;
            }
            let Some(value) = data.get(&def.field_def(field).name).filter(|v| !v.is_null())
            else {
                continue;
            };
            let current = self.require(id)?;
            self.write_field(current, field, value, trusted)?;
        }
        self.recompute_identity(id)?;

        for field in def.field_ids() {
            let field_def = def.field_def(field);
            if field_def.compute.is_some() && field_def.eager {
                self.queues.compute.push((id, field));
            }
        }
        self.require(id)
    }

    /// Write every known key of `data` into the record.
    pub(crate) fn update_inner(
        &mut self,
        id: LocalId,
        data: &Value,
        trusted: bool,
    ) -> Result<(), StoreError> {
        let id = self.require(id)?;
        let data = self.data_object(id.model, data)?;
        let schema = Arc::clone(&self.schema);
        let model = schema.model(id.model);
        for (name, value) in &data {
            let Ok(field) = model.field_id(name) else {
                debug!(model = %model.name(), field = %name, "skipping unknown field");
                continue;
            };
            let current = self.require(id)?;
            self.write_field(current, field, value, trusted)?;
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        id: LocalId,
        field: FieldId,
        value: &Value,
        trusted: bool,
    ) -> Result<(), StoreError> {
        match self.schema.field(id.model, field).kind {
            FieldKind::Attr => self.write_attr(id, field, value.clone(), trusted).map(|_| ()),
            FieldKind::One | FieldKind::Many => self.write_relation(id, field, value, trusted),
        }
    }

    /// Set an attribute. Returns false when the value did not change.
    pub(crate) fn write_attr(
        &mut self,
        id: LocalId,
        field: FieldId,
        value: Value,
        trusted: bool,
    ) -> Result<bool, StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.field(id.model, field);
        let id = self.require(id)?;

        let mut value = if def.html && !trusted {
            escape_markup(&value)
        } else {
            value
        };
        if let (Some(FieldOrder::Values(order)), Value::Array(items)) = (&def.order, &mut value) {
            items.sort_by(|a, b| order(a, b));
        }

        {
            let slot = self.slot_mut(id, field)?;
            let FieldValue::Attr(current) = &mut slot.value else {
                return Err(StoreError::FieldKind {
                    model: schema.model(id.model).name().to_string(),
                    field: def.name.clone(),
                    expected: FieldKind::Attr.label(),
                    actual: def.kind.label(),
                });
            };
            if *current == value {
                return Ok(false);
            }
            *current = value;
        }
        let stamp = self.tick(id.model, field);
        self.slot_mut(id, field)?.written_at = stamp;

        self.field_changed(id, field);
        if self.is_identity_field(id.model, field) {
            self.recompute_identity(id)?;
        }
        Ok(true)
    }

    pub(crate) fn occurrences(&self, owner: LocalId, field: FieldId, peer: LocalId) -> usize {
        self.records
            .get(&owner)
            .and_then(|record| record.list(field))
            .map_or(0, |list| list.count(peer))
    }
}

// =============================================================================
// RECONCILIATION
// =============================================================================

impl Store {
    /// Merge `current` into `found`, the record already holding one of its
    /// keys. Returns the survivor, or `None` when this pair is already being
    /// merged further up the stack.
    pub(crate) fn reconcile(
        &mut self,
        current: LocalId,
        found: LocalId,
    ) -> Result<Option<LocalId>, StoreError> {
        let pair = (current.min(found), current.max(found));
        if !self.reconciling.insert(pair) {
            return Ok(None);
        }
        let result = self.merge_records(current, found);
        self.reconciling.remove(&pair);
        result.map(|()| Some(found))
    }

    fn merge_records(&mut self, absorbed: LocalId, survivor: LocalId) -> Result<(), StoreError> {
        let schema = Arc::clone(&self.schema);
        let model = schema.model(survivor.model);
        debug!(
            absorbed = %self.describe(absorbed),
            survivor = %self.describe(survivor),
            "reconciling records"
        );

        // Referencers of the absorbed record point at the survivor instead.
        let referrers: Vec<(LocalId, FieldId)> = self
            .record_ref(absorbed)?
            .usage
            .pairs()
            .map(|(owner, field)| (self.canonical(owner).unwrap_or(owner), field))
            .collect();
        for &(owner, field) in &referrers {
            if let Some(list) = self.records.get_mut(&owner).and_then(|r| r.list_mut(field)) {
                list.repoint(absorbed, survivor);
            }
        }

        let mut gone = self
            .records
            .remove(&absorbed)
            .ok_or(StoreError::RecordNotFound(absorbed))?;

        let mut peers = BTreeSet::new();
        for record in [&gone, self.record_ref(survivor)?] {
            for slot in &record.fields {
                if let FieldValue::Relation(list) = &slot.value {
                    peers.extend(list.iter());
                }
            }
        }
        for peer in &peers {
            if let Some(record) = self.records.get_mut(peer) {
                record.usage.forget(absorbed);
            }
        }

        // Field by field: newest write wins, ties keep the survivor's value.
        let mut losers: Vec<(FieldId, LocalId)> = Vec::new();
        let kept = self
            .records
            .get_mut(&survivor)
            .ok_or(StoreError::RecordNotFound(survivor))?;
        for field in model.field_ids() {
            let def = model.field_def(field);
            let (Some(ours), Some(theirs)) = (
                kept.fields.get_mut(field.index()),
                gone.fields.get_mut(field.index()),
            ) else {
                continue;
            };
            let newer = theirs.written_at > ours.written_at;
            match (&mut ours.value, &mut theirs.value) {
                (FieldValue::Attr(a), FieldValue::Attr(b)) => {
                    if newer {
                        *a = std::mem::take(b);
                    }
                }
                (FieldValue::Relation(a), FieldValue::Relation(b)) if def.kind == FieldKind::Many => {
                    for peer in b.iter() {
                        if !a.contains(peer) {
                            a.push(peer);
                        }
                    }
                }
                (FieldValue::Relation(a), FieldValue::Relation(b)) => {
                    let (keep, lose) = if newer {
                        (b.first(), a.first())
                    } else {
                        (a.first(), b.first())
                    };
                    if let Some(loser) = lose.filter(|l| Some(*l) != keep) {
                        losers.push((field, loser));
                    }
                    a.replace(keep.into_iter().collect());
                }
                _ => {}
            }
            if newer {
                ours.written_at = theirs.written_at;
            }
            if def.compute.is_some() {
                ours.needs_compute = true;
            }
        }
        let absorbed_ids = std::mem::take(&mut gone.ids);
        kept.ids.extend(absorbed_ids.iter().copied());
        kept.object_ids.extend(gone.object_ids.iter().cloned());
        kept.deleting |= gone.deleting;

        for key in &gone.object_ids {
            self.object_index.insert(key.clone(), survivor);
        }
        for id in &absorbed_ids {
            self.aliases.insert(*id, survivor);
        }
        self.tables[survivor.model.index()].members.remove(&absorbed);
        self.tracker.rekey(absorbed, survivor);

        // Recount usage on the survivor and on every peer of either side.
        let mut pairs: BTreeSet<(LocalId, FieldId)> =
            self.record_ref(survivor)?.usage.pairs().collect();
        pairs.extend(gone.usage.pairs());
        let pairs: BTreeSet<(LocalId, FieldId)> = pairs
            .into_iter()
            .map(|(owner, field)| (self.canonical(owner).unwrap_or(owner), field))
            .collect();
        self.record_mut(survivor)?.usage.clear();
        for &(owner, field) in &pairs {
            let count = self.occurrences(owner, field, survivor);
            self.record_mut(survivor)?.usage.set(owner, field, count);
        }
        let relations: Vec<FieldId> = model
            .field_ids()
            .filter(|f| model.field_def(*f).kind.is_relation())
            .collect();
        for peer in peers {
            let Some(peer) = self.canonical(peer) else {
                continue;
            };
            for &field in &relations {
                let count = self.occurrences(survivor, field, peer);
                if let Some(record) = self.records.get_mut(&peer) {
                    record.usage.set(survivor, field, count);
                }
            }
        }

        // A to-one conflict leaves the losing peer pointing back at us.
        for (field, loser) in losers {
            if let Some(back) = model.field_def(field).inverse_field {
                if let Some(loser) = self.canonical(loser) {
                    while self.contains(loser, back, survivor) {
                        self.unlink(loser, back, survivor, false)?;
                    }
                }
            }
        }

        for field in model.field_ids() {
            self.notify((survivor, field));
            if model.field_def(field).compute.is_some() {
                self.invalidate((survivor, field));
            }
        }
        for &(owner, field) in &referrers {
            let owner = self.canonical(owner).unwrap_or(owner);
            self.notify((owner, field));
        }
        for (owner, field) in referrers {
            let Some(owner) = self.canonical(owner) else {
                continue;
            };
            if owner != survivor && self.is_identity_field(owner.model, field) {
                self.recompute_identity(owner)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// DELETION
// =============================================================================

impl Store {
    /// Physically remove a record queued for deletion.
    pub(crate) fn finalize_delete(&mut self, id: LocalId) -> Result<(), StoreError> {
        let Some(id) = self.canonical(id) else {
            return Ok(());
        };
        if !self.record_ref(id)?.deleting {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        let model = schema.model(id.model);
        debug!(record = %self.describe(id), "finalizing deletion");

        for field in model.field_ids() {
            match model.field_def(field).kind {
                FieldKind::Attr => self.notify((id, field)),
                FieldKind::One | FieldKind::Many => self.assign_ids(id, field, &[])?,
            }
        }

        // Whatever still references the record has no inverse through which
        // the clearing above could reach it.
        let referrers: Vec<(LocalId, FieldId)> = self.record_ref(id)?.usage.pairs().collect();
        for (owner, field) in referrers {
            let Some(owner) = self.canonical(owner) else {
                continue;
            };
            self.unlink_all(owner, field, id, true)?;
        }

        let record = self
            .records
            .remove(&id)
            .ok_or(StoreError::RecordNotFound(id))?;
        for key in &record.object_ids {
            if self.object_index.get(key) == Some(&id) {
                self.object_index.remove(key);
            }
        }
        for alias in &record.ids {
            self.aliases.remove(alias);
        }
        self.tables[id.model.index()].members.remove(&id);
        self.tracker.forget(&record.ids);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
