//! # Relation Lists
//!
//! Ordered membership of a to-one or to-many field, plus every structural
//! write that changes it.
//!
//! Each membership change keeps four things in step:
//! 1. the inverse list on the peer (through the inverse-suppressed variant),
//! 2. the peer's usage index,
//! 3. the on-add/on-delete hooks (deduplicated per cycle),
//! 4. the re-sort of lists with a record comparator.
//!
//! Raw data written into a relation is resolved (or created) in the target
//! model first, linked, and only then fully written. Identity that depends
//! on the relation is therefore stable before nested writes recurse.

use crate::primitives::{CMD_ADD, CMD_ADD_NO_INVERSE, CMD_DELETE, CMD_DELETE_NO_INVERSE};
use crate::schema::{FieldKind, FieldOrder};
use crate::store::Store;
use crate::{FieldId, LocalId, ModelId, RecordRef, StoreError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// RELATION LIST
// =============================================================================

/// Ordered sequence of record handles. Holds references only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationList {
    ids: Vec<LocalId>,
}

impl RelationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids(&self) -> &[LocalId] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = LocalId> + '_ {
        self.ids.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<LocalId> {
        self.ids.first().copied()
    }

    #[must_use]
    pub fn contains(&self, id: LocalId) -> bool {
        self.ids.contains(&id)
    }

    /// Occurrences of `id`.
    #[must_use]
    pub fn count(&self, id: LocalId) -> usize {
        self.ids.iter().filter(|x| **x == id).count()
    }

    #[must_use]
    pub fn position(&self, id: LocalId) -> Option<usize> {
        self.ids.iter().position(|x| *x == id)
    }

    /// Insert at `at`, clamped to the end.
    pub fn insert(&mut self, at: usize, id: LocalId) {
        let at = at.min(self.ids.len());
        self.ids.insert(at, id);
    }

    pub fn push(&mut self, id: LocalId) {
        self.ids.push(id);
    }

    pub fn remove(&mut self, at: usize) -> Option<LocalId> {
        (at < self.ids.len()).then(|| self.ids.remove(at))
    }

    pub fn replace(&mut self, ids: Vec<LocalId>) {
        self.ids = ids;
    }

    /// Replace `from` by `to` in place. When `to` is already a member the
    /// occurrences of `from` are dropped instead.
    pub fn repoint(&mut self, from: LocalId, to: LocalId) -> bool {
        if !self.contains(from) {
            return false;
        }
        let mut placed = self.contains(to);
        let mut next = Vec::with_capacity(self.ids.len());
        for id in self.ids.drain(..) {
            if id != from {
                next.push(id);
            } else if !placed {
                next.push(to);
                placed = true;
            }
        }
        self.ids = next;
        true
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// One operation of a relation command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOp {
    Add,
    Delete,
    AddNoInverse,
    DeleteNoInverse,
}

impl RelationOp {
    fn parse(name: &str) -> Option<Self> {
        match name {
            CMD_ADD => Some(Self::Add),
            CMD_DELETE => Some(Self::Delete),
            CMD_ADD_NO_INVERSE => Some(Self::AddNoInverse),
            CMD_DELETE_NO_INVERSE => Some(Self::DeleteNoInverse),
            _ => None,
        }
    }

    const fn inverse(self) -> bool {
        matches!(self, Self::Add | Self::Delete)
    }
}

/// A relation value as received at the store boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationCommand {
    /// `null` or `false`.
    Clear,
    /// A bare value or array: the full new membership.
    Replace(Vec<Value>),
    /// `[["ADD", x], ["DELETE", [y, z]], ...]`.
    Ops(Vec<(RelationOp, Vec<Value>)>),
}

fn as_command(item: &Value) -> Option<(RelationOp, &Value)> {
    let Value::Array(pair) = item else {
        return None;
    };
    let [Value::String(name), data] = pair.as_slice() else {
        return None;
    };
    RelationOp::parse(name).map(|op| (op, data))
}

impl RelationCommand {
    pub fn parse(value: &Value) -> Result<Self, StoreError> {
        let items = match value {
            Value::Null | Value::Bool(false) => return Ok(Self::Clear),
            Value::Array(items) => items,
            other => return Ok(Self::Replace(vec![other.clone()])),
        };
        if !items.first().is_some_and(|first| as_command(first).is_some()) {
            return Ok(Self::Replace(items.clone()));
        }

        let mut ops = Vec::with_capacity(items.len());
        for item in items {
            let (op, data) = as_command(item).ok_or_else(|| {
                StoreError::InvalidCommand(format!("expected [command, data], got {item}"))
            })?;
            let data = match data {
                Value::Array(many) => many.clone(),
                Value::Null => Vec::new(),
                one => vec![one.clone()],
            };
            ops.push((op, data));
        }
        Ok(Self::Ops(ops))
    }
}

// =============================================================================
// STRUCTURAL WRITES
// =============================================================================

/// A staged relation item: the resolved peer, plus raw data still to write.
pub(crate) type Staged = (LocalId, Option<Value>);

impl Store {
    pub(crate) fn target_of(&self, model: ModelId, field: FieldId) -> Result<ModelId, StoreError> {
        let def = self.schema.field(model, field);
        def.target_model.ok_or_else(|| StoreError::FieldKind {
            model: self.schema.model(model).name().to_string(),
            field: def.name.clone(),
            expected: FieldKind::Many.label(),
            actual: def.kind.label(),
        })
    }

    /// Phase one: resolve items to records of the target model, creating
    /// records for raw data that does not resolve.
    pub(crate) fn stage(
        &mut self,
        owner: LocalId,
        field: FieldId,
        items: Vec<RecordRef>,
        trusted: bool,
    ) -> Result<Vec<Staged>, StoreError> {
        let target = self.target_of(owner.model, field)?;
        let mut staged = Vec::with_capacity(items.len());
        for item in items {
            staged.push(match item {
                RecordRef::Id(id) => {
                    let id = self.require(id)?;
                    if id.model != target {
                        let schema = Arc::clone(&self.schema);
                        return Err(StoreError::InvalidField {
                            model: schema.model(owner.model).name().to_string(),
                            field: schema.field(owner.model, field).name.clone(),
                            reason: format!(
                                "{} is not a {}",
                                self.describe(id),
                                schema.model(target).name()
                            ),
                        });
                    }
                    (id, None)
                }
                RecordRef::Data(data) => (self.preinsert(target, &data, trusted)?, Some(data)),
            });
        }
        Ok(staged)
    }

    /// Phase two: write the full raw data of staged items.
    pub(crate) fn settle(&mut self, staged: Vec<Staged>, trusted: bool) -> Result<(), StoreError> {
        for (id, data) in staged {
            if let Some(data) = data {
                self.update_inner(id, &data, trusted)?;
            }
        }
        Ok(())
    }

    /// Resolve items without creating anything; unknown data is dropped.
    fn lookup(
        &self,
        target: ModelId,
        items: &[Value],
        trusted: bool,
    ) -> Result<Vec<LocalId>, StoreError> {
        let mut found = Vec::with_capacity(items.len());
        for item in items {
            if let Some(id) = self.resolve(target, item, trusted)? {
                found.push(id);
            }
        }
        Ok(found)
    }

    /// Route a relation value from `update` data.
    pub(crate) fn write_relation(
        &mut self,
        owner: LocalId,
        field: FieldId,
        value: &Value,
        trusted: bool,
    ) -> Result<(), StoreError> {
        match RelationCommand::parse(value)? {
            RelationCommand::Clear => self.assign_ids(owner, field, &[]),
            RelationCommand::Replace(items) => {
                let staged = self.stage(
                    owner,
                    field,
                    items.into_iter().map(RecordRef::Data).collect(),
                    trusted,
                )?;
                let ids: Vec<LocalId> = staged.iter().map(|(id, _)| *id).collect();
                let owner = self.require(owner)?;
                self.assign_ids(owner, field, &ids)?;
                self.settle(staged, trusted)
            }
            RelationCommand::Ops(ops) => {
                let target = self.target_of(owner.model, field)?;
                for (op, items) in ops {
                    match op {
                        RelationOp::Add | RelationOp::AddNoInverse => {
                            let staged = self.stage(
                                owner,
                                field,
                                items.into_iter().map(RecordRef::Data).collect(),
                                trusted,
                            )?;
                            for &(peer, _) in &staged {
                                let owner = self.require(owner)?;
                                let peer = self.require(peer)?;
                                if !self.contains(owner, field, peer) {
                                    self.link(owner, field, peer, None, op.inverse())?;
                                }
                            }
                            self.settle(staged, trusted)?;
                        }
                        RelationOp::Delete | RelationOp::DeleteNoInverse => {
                            for peer in self.lookup(target, &items, trusted)? {
                                let owner = self.require(owner)?;
                                self.unlink_all(owner, field, peer, op.inverse())?;
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Insert `peer` into `owner.field` at `at` (end when `None`).
    ///
    /// A to-one list evicts its previous occupant first, inverse included.
    pub(crate) fn link(
        &mut self,
        owner: LocalId,
        field: FieldId,
        peer: LocalId,
        at: Option<usize>,
        inverse: bool,
    ) -> Result<bool, StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.field(owner.model, field);
        let mut owner = self.require(owner)?;
        let peer = self.require(peer)?;

        if def.kind == FieldKind::One {
            let current = self.list(owner, field)?.first();
            if current == Some(peer) {
                return Ok(false);
            }
            if let Some(previous) = current {
                self.unlink(owner, field, previous, true)?;
                owner = self.require(owner)?;
            }
        }

        self.list_mut(owner, field)?
            .insert(at.unwrap_or(usize::MAX), peer);
        let stamp = self.tick(owner.model, field);
        self.slot_mut(owner, field)?.written_at = stamp;
        if let Some(record) = self.records.get_mut(&peer) {
            record.usage.add(owner, field);
        }

        if inverse {
            if let Some(back) = def.inverse_field {
                if !self.contains(peer, back, owner) {
                    self.link(peer, back, owner, None, false)?;
                }
            }
        }

        if def.on_add.is_some() {
            self.queues.on_add.push((owner, field, peer));
        }
        self.field_changed(owner, field);
        if matches!(def.order, Some(FieldOrder::Records(_))) {
            self.queues.sort.push((owner, field));
        }
        if self.is_identity_field(owner.model, field) {
            self.recompute_identity(owner)?;
        }
        Ok(true)
    }

    /// Remove the first occurrence of `peer` from `owner.field`.
    pub(crate) fn unlink(
        &mut self,
        owner: LocalId,
        field: FieldId,
        peer: LocalId,
        inverse: bool,
    ) -> Result<bool, StoreError> {
        let Some(at) = self.list(owner, field)?.position(peer) else {
            return Ok(false);
        };
        Ok(self.unlink_at(owner, field, at, inverse)?.is_some())
    }

    /// Remove every occurrence of `peer` from `owner.field`.
    pub(crate) fn unlink_all(
        &mut self,
        owner: LocalId,
        field: FieldId,
        peer: LocalId,
        inverse: bool,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;
        while self.unlink(owner, field, peer, inverse)? {
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove the member at `at`.
    ///
    /// The inverse side is only cut once the owner holds no occurrence of
    /// the peer anymore.
    pub(crate) fn unlink_at(
        &mut self,
        owner: LocalId,
        field: FieldId,
        at: usize,
        inverse: bool,
    ) -> Result<Option<LocalId>, StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.field(owner.model, field);
        let owner = self.require(owner)?;
        let Some(peer) = self.list_mut(owner, field)?.remove(at) else {
            return Ok(None);
        };
        let stamp = self.tick(owner.model, field);
        self.slot_mut(owner, field)?.written_at = stamp;
        if let Some(record) = self.records.get_mut(&peer) {
            record.usage.remove(owner, field);
        }

        if inverse && !self.contains(owner, field, peer) {
            if let Some(back) = def.inverse_field {
                while self.contains(peer, back, owner) {
                    self.unlink(peer, back, owner, false)?;
                }
            }
        }

        if def.on_delete.is_some() {
            self.queues.on_delete.push((owner, field, peer));
        }
        self.field_changed(owner, field);
        if self.is_identity_field(owner.model, field) {
            self.recompute_identity(owner)?;
        }
        Ok(Some(peer))
    }

    /// Make `owner.field` hold exactly `ids`, in that order, without
    /// duplicates. A to-one list keeps the last id only.
    pub(crate) fn assign_ids(
        &mut self,
        owner: LocalId,
        field: FieldId,
        ids: &[LocalId],
    ) -> Result<(), StoreError> {
        let schema = Arc::clone(&self.schema);
        let def = schema.field(owner.model, field);

        let mut wanted: Vec<LocalId> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = self.require(*id)?;
            if !wanted.contains(&id) {
                wanted.push(id);
            }
        }
        if def.kind == FieldKind::One && wanted.len() > 1 {
            wanted.drain(..wanted.len() - 1);
        }

        // Drop unwanted members and repeated occurrences.
        loop {
            let mut seen = BTreeSet::new();
            let extra = self
                .list(owner, field)?
                .iter()
                .position(|id| !wanted.contains(&id) || !seen.insert(id));
            let Some(at) = extra else {
                break;
            };
            self.unlink_at(owner, field, at, true)?;
        }

        for &peer in &wanted {
            let owner = self.require(owner)?;
            if let Some(peer) = self.canonical(peer) {
                if !self.contains(owner, field, peer) {
                    self.link(owner, field, peer, None, true)?;
                }
            }
        }

        let owner = self.require(owner)?;
        let wanted: Vec<LocalId> = wanted.iter().filter_map(|id| self.canonical(*id)).collect();
        let current: Vec<LocalId> = self.list(owner, field)?.iter().collect();
        let same_members = current.len() == wanted.len()
            && wanted.iter().all(|id| current.contains(id));
        if current != wanted && same_members {
            self.list_mut(owner, field)?.replace(wanted);
            let stamp = self.tick(owner.model, field);
            self.slot_mut(owner, field)?.written_at = stamp;
            self.field_changed(owner, field);
            if matches!(def.order, Some(FieldOrder::Records(_))) {
                self.queues.sort.push((owner, field));
            }
        }
        Ok(())
    }
}

// =============================================================================
// ACCESSOR
// =============================================================================

/// Mutable view of one relation field of one record.
///
/// Every mutator runs as its own update cycle (or joins the enclosing one).
#[derive(Debug)]
pub struct RelationMut<'a> {
    store: &'a mut Store,
    owner: LocalId,
    field: FieldId,
}

impl<'a> RelationMut<'a> {
    pub(crate) fn new(store: &'a mut Store, owner: LocalId, field: FieldId) -> Self {
        Self {
            store,
            owner,
            field,
        }
    }

    /// Current members, in order.
    pub fn ids(&self) -> Result<Vec<LocalId>, StoreError> {
        Ok(self.store.list(self.owner, self.field)?.iter().collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.store.list(self.owner, self.field)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.store.list(self.owner, self.field)?.is_empty())
    }

    #[must_use]
    pub fn contains(&self, id: LocalId) -> bool {
        self.store
            .canonical(id)
            .is_some_and(|id| self.store.contains(self.owner, self.field, id))
    }

    fn insert_at(&mut self, at: Option<usize>, item: RecordRef) -> Result<LocalId, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store.with_update(|store| {
            let staged = store.stage(owner, field, vec![item], false)?;
            let mut peer = None;
            for &(id, _) in &staged {
                store.link(owner, field, id, at, true)?;
                peer = Some(id);
            }
            store.settle(staged, false)?;
            let peer = peer.ok_or(StoreError::RecordNotFound(owner))?;
            store.require(peer)
        })
    }

    /// Append, duplicates allowed.
    pub fn push(&mut self, item: impl Into<RecordRef>) -> Result<LocalId, StoreError> {
        self.insert_at(None, item.into())
    }

    /// Prepend, duplicates allowed.
    pub fn unshift(&mut self, item: impl Into<RecordRef>) -> Result<LocalId, StoreError> {
        self.insert_at(Some(0), item.into())
    }

    pub fn pop(&mut self) -> Result<Option<LocalId>, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store.with_update(|store| {
            let len = store.list(owner, field)?.len();
            if len == 0 {
                return Ok(None);
            }
            store.unlink_at(owner, field, len - 1, true)
        })
    }

    pub fn shift(&mut self) -> Result<Option<LocalId>, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store
            .with_update(|store| store.unlink_at(owner, field, 0, true))
    }

    /// Remove `delete_count` members at `start`, then insert `items` there.
    /// Returns the removed members.
    pub fn splice(
        &mut self,
        start: usize,
        delete_count: usize,
        items: Vec<RecordRef>,
    ) -> Result<Vec<LocalId>, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store.with_update(|store| {
            let staged = store.stage(owner, field, items, false)?;
            let len = store.list(owner, field)?.len();
            let start = start.min(len);
            let mut removed = Vec::new();
            for _ in 0..delete_count.min(len - start) {
                if let Some(id) = store.unlink_at(owner, field, start, true)? {
                    removed.push(id);
                }
            }
            for (offset, &(peer, _)) in staged.iter().enumerate() {
                store.link(owner, field, peer, Some(start + offset), true)?;
            }
            store.settle(staged, false)?;
            Ok(removed)
        })
    }

    /// Set-like insert: a member already present is left alone.
    pub fn add(&mut self, item: impl Into<RecordRef>) -> Result<LocalId, StoreError> {
        let (owner, field, item) = (self.owner, self.field, item.into());
        self.store.with_update(|store| {
            let staged = store.stage(owner, field, vec![item], false)?;
            let mut peer = None;
            for &(id, _) in &staged {
                let owner = store.require(owner)?;
                if !store.contains(owner, field, id) {
                    store.link(owner, field, id, None, true)?;
                }
                peer = Some(id);
            }
            store.settle(staged, false)?;
            let peer = peer.ok_or(StoreError::RecordNotFound(owner))?;
            store.require(peer)
        })
    }

    /// Set-like removal of every occurrence.
    pub fn delete(&mut self, id: LocalId) -> Result<bool, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store.with_update(|store| {
            let Some(peer) = store.canonical(id) else {
                return Ok(false);
            };
            Ok(store.unlink_all(owner, field, peer, true)? > 0)
        })
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store
            .with_update(|store| store.assign_ids(owner, field, &[]))
    }

    /// Replace the whole membership.
    pub fn assign(&mut self, items: Vec<RecordRef>) -> Result<Vec<LocalId>, StoreError> {
        let (owner, field) = (self.owner, self.field);
        self.store.with_update(|store| {
            let staged = store.stage(owner, field, items, false)?;
            let ids: Vec<LocalId> = staged.iter().map(|(id, _)| *id).collect();
            store.assign_ids(owner, field, &ids)?;
            store.settle(staged, false)?;
            Ok(store.list(owner, field)?.iter().collect())
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
