//! # Identity Engine
//!
//! Derives object identifiers ("semantic keys") from a record's identifying
//! field values and maps them to records.
//!
//! An identity expression is normalized once into a disjunction of
//! conjunctive clauses. A record is identified by every clause whose fields
//! are all set; each such clause yields one or more keys of the form
//! `Model{field: value, other: value}`.
//!
//! Relational fields expand to every local id of the related record, since
//! a record that was merged still answers to all of its ids. The expansion
//! is capped (`StoreOptions::max_identity_candidates`).

use crate::record::escape_markup;
use crate::schema::{FieldKind, Model};
use crate::store::Store;
use crate::{FieldId, LocalId, ModelId, StoreError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::trace;

// =============================================================================
// IDENTITY EXPRESSION
// =============================================================================

/// How records of a model are identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityExpr {
    /// A single field.
    Field(String),
    /// All sub-expressions together.
    And(Vec<IdentityExpr>),
    /// Any one of the sub-expressions.
    Or(Vec<IdentityExpr>),
}

impl IdentityExpr {
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    #[must_use]
    pub fn and<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Self>,
    {
        Self::And(items.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn or<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Self>,
    {
        Self::Or(items.into_iter().map(Into::into).collect())
    }

    /// Normalize into clauses of field names.
    ///
    /// Field names repeat at most once per clause and clauses are unique,
    /// in first-seen order.
    #[must_use]
    pub fn clauses(&self) -> Vec<Vec<String>> {
        let raw = match self {
            Self::Field(name) => vec![vec![name.clone()]],
            Self::Or(items) => items.iter().flat_map(Self::clauses).collect(),
            Self::And(items) => {
                let mut acc: Vec<Vec<String>> = vec![Vec::new()];
                for item in items {
                    let options = item.clauses();
                    let mut next = Vec::with_capacity(acc.len() * options.len());
                    for prefix in &acc {
                        for option in &options {
                            let mut clause = prefix.clone();
                            for name in option {
                                if !clause.contains(name) {
                                    clause.push(name.clone());
                                }
                            }
                            next.push(clause);
                        }
                    }
                    acc = next;
                }
                acc
            }
        };

        let mut clauses: Vec<Vec<String>> = Vec::with_capacity(raw.len());
        for clause in raw {
            if !clauses.contains(&clause) {
                clauses.push(clause);
            }
        }
        clauses
    }
}

impl From<&str> for IdentityExpr {
    fn from(name: &str) -> Self {
        Self::Field(name.to_string())
    }
}

impl From<String> for IdentityExpr {
    fn from(name: String) -> Self {
        Self::Field(name)
    }
}

/// A list is an implicit OR.
impl<E: Into<IdentityExpr>> From<Vec<E>> for IdentityExpr {
    fn from(items: Vec<E>) -> Self {
        Self::or(items)
    }
}

// =============================================================================
// KEY CONSTRUCTION
// =============================================================================

/// Append the cross product of `parts` as keys of `model` to `out`.
fn push_keys(
    model: &str,
    parts: &[(&str, Vec<String>)],
    limit: usize,
    out: &mut Vec<String>,
) -> Result<(), StoreError> {
    let count = parts
        .iter()
        .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
        .unwrap_or(usize::MAX);
    let total = out.len().saturating_add(count);
    if total > limit {
        return Err(StoreError::TooManyCandidates {
            model: model.to_string(),
            count: total,
            limit,
        });
    }

    let mut bodies = vec![String::new()];
    for (name, values) in parts {
        let mut next = Vec::with_capacity(bodies.len() * values.len());
        for body in &bodies {
            for value in values {
                let mut key = body.clone();
                if !key.is_empty() {
                    key.push_str(", ");
                }
                key.push_str(name);
                key.push_str(": ");
                key.push_str(value);
                next.push(key);
            }
        }
        bodies = next;
    }
    out.extend(bodies.into_iter().map(|body| format!("{model}{{{body}}}")));
    Ok(())
}

/// The single record reference a relational identity value stands for.
fn single_item(value: &Value) -> Option<&Value> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::Array(items) if items.len() == 1 && !items[0].is_array() => items.first(),
        Value::Array(_) => None,
        other => Some(other),
    }
}

impl Store {
    /// View `data` as an object, expanding identity shorthand.
    pub(crate) fn data_object(
        &self,
        model: ModelId,
        data: &Value,
    ) -> Result<Map<String, Value>, StoreError> {
        let model = self.schema.model(model);
        match data {
            Value::Object(map) => return Ok(map.clone()),
            Value::Array(_) => return Err(StoreError::ArrayData(model.name().to_string())),
            _ => {}
        }
        let field = model.shorthand_field()?;
        let mut map = Map::new();
        map.insert(model.field_def(field).name.clone(), data.clone());
        Ok(map)
    }

    /// Display form of a local id, `Model_seq`.
    #[must_use]
    pub fn describe(&self, id: LocalId) -> String {
        format!("{}_{}", self.schema.model(id.model).name(), id.seq)
    }

    fn described_ids(&self, id: LocalId) -> Option<Vec<String>> {
        let record = self.records.get(&self.canonical(id)?)?;
        Some(record.ids.iter().map(|id| self.describe(*id)).collect())
    }

    /// Candidate keys for raw `data` of `model`.
    fn data_keys(
        &self,
        model: &Model,
        data: &Map<String, Value>,
        trusted: bool,
    ) -> Result<Vec<String>, StoreError> {
        let limit = self.options.max_identity_candidates;
        let mut keys = Vec::new();
        'clauses: for clause in &model.clauses {
            let mut parts = Vec::with_capacity(clause.len());
            for &field in clause {
                let def = model.field_def(field);
                let Some(value) = data.get(&def.name).filter(|v| !v.is_null()) else {
                    continue 'clauses;
                };
                let rendered = match (def.kind, def.target_model) {
                    (FieldKind::Attr, _) => {
                        let value = if def.html && !trusted {
                            escape_markup(value)
                        } else {
                            value.clone()
                        };
                        vec![value.to_string()]
                    }
                    (_, Some(target)) => {
                        let Some(item) = single_item(value) else {
                            continue 'clauses;
                        };
                        let Some(peer) = self.resolve(target, item, trusted)? else {
                            continue 'clauses;
                        };
                        match self.described_ids(peer) {
                            Some(ids) => ids,
                            None => continue 'clauses,
                        }
                    }
                    _ => continue 'clauses,
                };
                parts.push((def.name.as_str(), rendered));
            }
            push_keys(&model.name, &parts, limit, &mut keys)?;
        }
        Ok(keys)
    }

    /// Candidate keys for the current field values of a live record.
    pub(crate) fn record_keys(&self, id: LocalId) -> Result<Vec<String>, StoreError> {
        let record = self.record_ref(id)?;
        let model = self.schema.model(id.model);
        let limit = self.options.max_identity_candidates;
        let mut keys = Vec::new();
        'clauses: for clause in &model.clauses {
            let mut parts = Vec::with_capacity(clause.len());
            for &field in clause {
                let rendered = match record.attr(field) {
                    Some(value) if !value.is_null() => vec![value.to_string()],
                    Some(_) => continue 'clauses,
                    None => {
                        let peer = record.list(field).and_then(|list| list.first());
                        match peer.and_then(|peer| self.described_ids(peer)) {
                            Some(ids) => ids,
                            None => continue 'clauses,
                        }
                    }
                };
                parts.push((model.field_def(field).name.as_str(), rendered));
            }
            push_keys(&model.name, &parts, limit, &mut keys)?;
        }
        Ok(keys)
    }

    /// Find the live record `data` identifies, if any.
    pub(crate) fn resolve(
        &self,
        model: ModelId,
        data: &Value,
        trusted: bool,
    ) -> Result<Option<LocalId>, StoreError> {
        let map = self.data_object(model, data)?;
        let keys = self.data_keys(self.schema.model(model), &map, trusted)?;
        Ok(keys.iter().find_map(|key| {
            self.object_index
                .get(key)
                .and_then(|id| self.canonical(*id))
        }))
    }

    /// Re-derive the keys of a record after an identifying field changed.
    ///
    /// A key already held by another live record merges the two; the
    /// survivor is then re-identified in turn.
    pub(crate) fn recompute_identity(&mut self, id: LocalId) -> Result<(), StoreError> {
        let Some(id) = self.canonical(id) else {
            return Ok(());
        };
        let keys: BTreeSet<String> = self.record_keys(id)?.into_iter().collect();
        let previous = self.record_ref(id)?.object_ids.clone();

        for stale in previous.difference(&keys) {
            if self.object_index.get(stale).and_then(|held| self.canonical(*held)) == Some(id) {
                self.object_index.remove(stale);
            }
            self.record_mut(id)?.object_ids.remove(stale);
        }

        for key in keys.difference(&previous) {
            let holder = self
                .object_index
                .get(key)
                .and_then(|held| self.canonical(*held));
            match holder {
                Some(other) if other != id => {
                    trace!(key = %key, "identity collision");
                    if let Some(survivor) = self.reconcile(id, other)? {
                        return self.recompute_identity(survivor);
                    }
                }
                _ => {
                    self.object_index.insert(key.clone(), id);
                    self.record_mut(id)?.object_ids.insert(key.clone());
                }
            }
        }
        Ok(())
    }

    /// Whether writing `field` of `model` can change identities.
    pub(crate) fn is_identity_field(&self, model: ModelId, field: FieldId) -> bool {
        self.schema.model(model).is_identity_field(field)
    }
}

// =============================================================================
// TESTS
// =============================================================================
