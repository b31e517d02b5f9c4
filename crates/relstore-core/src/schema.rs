//! # Field Schema
//!
//! Static per-model metadata: field kinds, relation targets, inverses,
//! derived-field functions and hooks.
//!
//! Models are declared with builders and assembled exactly once:
//!
//! ```
//! use relstore_core::{Field, IdentityExpr, Model, Store};
//!
//! let store = Store::builder()
//!     .model(
//!         Model::new("Tag")
//!             .identity(IdentityExpr::field("name"))
//!             .field(Field::attr("name"))
//!             .field(Field::many("todos", "Todo").inverse("tags")),
//!     )
//!     .model(
//!         Model::new("Todo")
//!             .identity(IdentityExpr::field("id"))
//!             .field(Field::attr("id"))
//!             .field(Field::many("tags", "Tag").inverse("todos")),
//!     )
//!     .build()
//!     .expect("valid schema");
//! assert_eq!(store.schema().models().count(), 2);
//! ```
//!
//! Assembly rejects every inconsistency up front: duplicate names, unknown
//! targets, inverses that do not point back, unusable identities.

use crate::identity::IdentityExpr;
use crate::store::{Store, StoreOptions};
use crate::tracking::Ctx;
use crate::{FieldId, LocalId, ModelId, StoreError};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// FUNCTION TYPES
// =============================================================================

/// Derives a field value. Reads made through the context become dependencies.
pub type ComputeFn = Arc<dyn Fn(&mut Ctx<'_>) -> Result<Computed, StoreError> + Send + Sync>;

/// Orders two members of a relation list.
pub type RecordOrderFn =
    Arc<dyn Fn(&mut Ctx<'_>, LocalId, LocalId) -> Result<Ordering, StoreError> + Send + Sync>;

/// Orders two elements of an array attribute.
pub type ValueOrderFn = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// Runs after a field (or, for model listeners, any watched field) changed.
pub type HookFn = Arc<dyn Fn(&mut Ctx<'_>) -> Result<(), StoreError> + Send + Sync>;

/// Runs after a peer was added to or removed from a relation.
pub type PeerHookFn = Arc<dyn Fn(&mut Ctx<'_>, LocalId) -> Result<(), StoreError> + Send + Sync>;

/// Output of a compute function.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    /// New attribute value.
    Value(Value),
    /// New relation membership, in order.
    Records(Vec<LocalId>),
}

impl From<Value> for Computed {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<LocalId>> for Computed {
    fn from(ids: Vec<LocalId>) -> Self {
        Self::Records(ids)
    }
}

impl From<Option<LocalId>> for Computed {
    fn from(id: Option<LocalId>) -> Self {
        Self::Records(id.into_iter().collect())
    }
}

impl From<LocalId> for Computed {
    fn from(id: LocalId) -> Self {
        Self::Records(vec![id])
    }
}

// =============================================================================
// FIELD
// =============================================================================

/// Kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKind {
    /// Scalar or JSON value.
    Attr,
    /// To-one relation (at most one member).
    One,
    /// To-many relation (ordered, unbounded).
    Many,
}

impl FieldKind {
    #[must_use]
    pub const fn is_relation(self) -> bool {
        !matches!(self, Self::Attr)
    }

    pub(crate) const fn label(self) -> &'static str {
        match self {
            Self::Attr => "an attribute",
            Self::One => "a to-one relation",
            Self::Many => "a to-many relation",
        }
    }
}

#[derive(Clone)]
pub(crate) enum FieldOrder {
    Records(RecordOrderFn),
    Values(ValueOrderFn),
}

/// Declaration of one field.
#[derive(Clone)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) target: Option<String>,
    pub(crate) inverse: Option<String>,
    pub(crate) default: Value,
    pub(crate) html: bool,
    pub(crate) eager: bool,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) order: Option<FieldOrder>,
    pub(crate) on_add: Option<PeerHookFn>,
    pub(crate) on_delete: Option<PeerHookFn>,
    pub(crate) on_update: Option<HookFn>,
    // Resolved at assembly.
    pub(crate) target_model: Option<ModelId>,
    pub(crate) inverse_field: Option<FieldId>,
}

impl Field {
    fn with_kind(name: impl Into<String>, kind: FieldKind, target: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target,
            inverse: None,
            default: Value::Null,
            html: false,
            eager: false,
            compute: None,
            order: None,
            on_add: None,
            on_delete: None,
            on_update: None,
            target_model: None,
            inverse_field: None,
        }
    }

    /// Declare an attribute.
    #[must_use]
    pub fn attr(name: impl Into<String>) -> Self {
        Self::with_kind(name, FieldKind::Attr, None)
    }

    /// Declare a to-one relation to `target`.
    #[must_use]
    pub fn one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(name, FieldKind::One, Some(target.into()))
    }

    /// Declare a to-many relation to `target`.
    #[must_use]
    pub fn many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(name, FieldKind::Many, Some(target.into()))
    }

    /// Initial attribute value.
    #[must_use]
    pub fn default(mut self, value: Value) -> Self {
        self.default = value;
        self
    }

    /// Mark the attribute as carrying markup.
    #[must_use]
    pub fn html(mut self) -> Self {
        self.html = true;
        self
    }

    /// Recompute as soon as a dependency changes instead of on next read.
    #[must_use]
    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Name of the field on the target model that mirrors this relation.
    #[must_use]
    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse = Some(name.into());
        self
    }

    /// Derive the field from other fields.
    #[must_use]
    pub fn compute<F, C>(mut self, f: F) -> Self
    where
        F: Fn(&mut Ctx<'_>) -> Result<C, StoreError> + Send + Sync + 'static,
        C: Into<Computed>,
    {
        self.compute = Some(Arc::new(move |ctx| f(ctx).map(Into::into)));
        self
    }

    /// Keep the relation ordered with a record comparator.
    #[must_use]
    pub fn sort_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Ctx<'_>, LocalId, LocalId) -> Result<Ordering, StoreError>
            + Send
            + Sync
            + 'static,
    {
        self.order = Some(FieldOrder::Records(Arc::new(f)));
        self
    }

    /// Keep an array attribute ordered with a value comparator.
    #[must_use]
    pub fn sort_values<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(FieldOrder::Values(Arc::new(f)));
        self
    }

    /// Hook run once per cycle for each peer added to the relation.
    #[must_use]
    pub fn on_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Ctx<'_>, LocalId) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_add = Some(Arc::new(f));
        self
    }

    /// Hook run once per cycle for each peer removed from the relation.
    #[must_use]
    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Ctx<'_>, LocalId) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Hook run once per cycle after the field changed.
    #[must_use]
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Ctx<'_>) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Target model name for relations.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Declared inverse field name.
    #[must_use]
    pub fn inverse_name(&self) -> Option<&str> {
        self.inverse.as_deref()
    }

    /// Whether the field recomputes eagerly. Always true for relations with
    /// an inverse once the schema is assembled.
    #[must_use]
    pub fn is_eager(&self) -> bool {
        self.eager
    }

    #[must_use]
    pub fn is_computed(&self) -> bool {
        self.compute.is_some()
    }

    #[must_use]
    pub fn is_html(&self) -> bool {
        self.html
    }

    fn invalid(&self, model: &str, reason: impl Into<String>) -> StoreError {
        StoreError::InvalidField {
            model: model.to_string(),
            field: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("inverse", &self.inverse)
            .field("eager", &self.eager)
            .field("computed", &self.compute.is_some())
            .finish()
    }
}

// =============================================================================
// MODEL
// =============================================================================

#[derive(Clone)]
pub(crate) struct ChangeListener {
    pub(crate) fields: Vec<String>,
    pub(crate) watched: BTreeSet<FieldId>,
    pub(crate) handler: HookFn,
}

/// Declaration of one model.
#[derive(Clone)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) identity: Option<IdentityExpr>,
    pub(crate) singleton: bool,
    pub(crate) fields: Vec<Field>,
    pub(crate) listeners: Vec<ChangeListener>,
    // Resolved at assembly.
    pub(crate) id: ModelId,
    pub(crate) clauses: Vec<Vec<FieldId>>,
    pub(crate) field_index: BTreeMap<String, FieldId>,
    pub(crate) identity_fields: BTreeSet<FieldId>,
}

impl Model {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: None,
            singleton: false,
            fields: Vec::new(),
            listeners: Vec::new(),
            id: ModelId(0),
            clauses: Vec::new(),
            field_index: BTreeMap::new(),
            identity_fields: BTreeSet::new(),
        }
    }

    /// How records of this model are identified.
    #[must_use]
    pub fn identity(mut self, expr: impl Into<IdentityExpr>) -> Self {
        self.identity = Some(expr.into());
        self
    }

    /// At most one record of this model ever exists.
    #[must_use]
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Run `handler` once per cycle on each record where any of `fields`
    /// changed.
    #[must_use]
    pub fn on_change<I, S, F>(mut self, fields: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut Ctx<'_>) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.listeners.push(ChangeListener {
            fields: fields.into_iter().map(Into::into).collect(),
            watched: BTreeSet::new(),
            handler: Arc::new(handler),
        });
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> ModelId {
        self.id
    }

    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Field ids in declaration order.
    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + use<> {
        (0..self.fields.len() as u32).map(FieldId)
    }

    pub fn field_id(&self, name: &str) -> Result<FieldId, StoreError> {
        self.field_index
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::UnknownField {
                model: self.name.clone(),
                field: name.to_string(),
            })
    }

    #[must_use]
    pub fn field_def(&self, field: FieldId) -> &Field {
        &self.fields[field.index()]
    }

    /// Normalized identity as clauses of field names.
    #[must_use]
    pub fn identity_clauses(&self) -> Vec<Vec<&str>> {
        self.clauses
            .iter()
            .map(|clause| {
                clause
                    .iter()
                    .map(|f| self.fields[f.index()].name.as_str())
                    .collect()
            })
            .collect()
    }

    #[must_use]
    pub fn is_identity_field(&self, field: FieldId) -> bool {
        self.identity_fields.contains(&field)
    }

    /// The field non-object data stands for.
    pub(crate) fn shorthand_field(&self) -> Result<FieldId, StoreError> {
        let singles: BTreeSet<FieldId> = self
            .clauses
            .iter()
            .filter(|clause| clause.len() == 1)
            .map(|clause| clause[0])
            .collect();
        match singles.len() {
            1 => singles
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::IdentityShorthand(self.name.clone())),
            _ => Err(StoreError::IdentityShorthand(self.name.clone())),
        }
    }

    pub(crate) fn listeners_of(&self, field: FieldId) -> impl Iterator<Item = usize> + '_ {
        self.listeners
            .iter()
            .enumerate()
            .filter(move |(_, l)| l.watched.contains(&field))
            .map(|(i, _)| i)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("singleton", &self.singleton)
            .field("fields", &self.fields)
            .finish()
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

/// The assembled, immutable set of models.
#[derive(Debug)]
pub struct Schema {
    models: Vec<Model>,
    by_name: BTreeMap<String, ModelId>,
}

impl Schema {
    /// Validate declarations and resolve names into ids.
    pub(crate) fn assemble(mut models: Vec<Model>) -> Result<Self, StoreError> {
        let mut by_name = BTreeMap::new();
        for (i, model) in models.iter_mut().enumerate() {
            let id = ModelId(i as u32);
            if by_name.insert(model.name.clone(), id).is_some() {
                return Err(StoreError::DuplicateModel(model.name.clone()));
            }
            model.id = id;
            for (j, field) in model.fields.iter().enumerate() {
                if model
                    .field_index
                    .insert(field.name.clone(), FieldId(j as u32))
                    .is_some()
                {
                    return Err(StoreError::DuplicateField {
                        model: model.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }

        // Relation targets.
        for model in &mut models {
            for field in &mut model.fields {
                let Some(target) = field.target.as_ref() else {
                    continue;
                };
                let target_id =
                    by_name
                        .get(target)
                        .copied()
                        .ok_or_else(|| StoreError::UnknownTarget {
                            model: model.name.clone(),
                            field: field.name.clone(),
                            target: target.clone(),
                        })?;
                field.target_model = Some(target_id);
            }
        }

        // Inverses must be declared symmetrically.
        let mut inverses = Vec::new();
        for (i, model) in models.iter().enumerate() {
            for (j, field) in model.fields.iter().enumerate() {
                let (Some(inverse), Some(target)) = (field.inverse.as_ref(), field.target_model)
                else {
                    continue;
                };
                let mismatch = |reason: String| StoreError::InverseMismatch {
                    model: model.name.clone(),
                    field: field.name.clone(),
                    reason,
                };
                let target_model = &models[target.index()];
                let back_id = target_model.field_index.get(inverse).copied().ok_or_else(|| {
                    mismatch(format!("{} has no field {}", target_model.name, inverse))
                })?;
                let back = &target_model.fields[back_id.index()];
                if !back.kind.is_relation() || back.target.as_deref() != Some(model.name.as_str())
                {
                    return Err(mismatch(format!(
                        "{}.{} does not target {}",
                        target_model.name, inverse, model.name
                    )));
                }
                if back.inverse.as_deref() != Some(field.name.as_str()) {
                    return Err(mismatch(format!(
                        "{}.{} does not declare {} as inverse",
                        target_model.name, inverse, field.name
                    )));
                }
                inverses.push((i, j, back_id));
            }
        }
        for (i, j, back_id) in inverses {
            let field = &mut models[i].fields[j];
            field.inverse_field = Some(back_id);
            // Relations with an inverse are always evaluated eagerly.
            field.eager = true;
        }

        for model in &mut models {
            Self::resolve_identity(model)?;
            Self::check_fields(model)?;
            Self::resolve_listeners(model)?;
        }

        Ok(Self { models, by_name })
    }

    fn resolve_identity(model: &mut Model) -> Result<(), StoreError> {
        let invalid = |reason: String| StoreError::InvalidIdentity {
            model: model.name.clone(),
            reason,
        };
        let named: Vec<Vec<String>> = match (&model.identity, model.singleton) {
            (Some(_), true) => {
                return Err(invalid("a singleton cannot declare an identity".into()));
            }
            (None, true) => vec![Vec::new()],
            (None, false) => Vec::new(),
            (Some(expr), false) => expr.clauses(),
        };

        let mut clauses = Vec::with_capacity(named.len());
        for names in named {
            if names.is_empty() && !model.singleton {
                return Err(invalid("identity produces an empty clause".into()));
            }
            let mut clause = Vec::with_capacity(names.len());
            for name in names {
                let id = model
                    .field_index
                    .get(&name)
                    .copied()
                    .ok_or_else(|| invalid(format!("unknown field {name}")))?;
                if model.fields[id.index()].kind == FieldKind::Many {
                    return Err(invalid(format!("to-many field {name} cannot identify")));
                }
                clause.push(id);
            }
            model.identity_fields.extend(clause.iter().copied());
            clauses.push(clause);
        }
        model.clauses = clauses;
        Ok(())
    }

    fn check_fields(model: &Model) -> Result<(), StoreError> {
        for field in &model.fields {
            match (field.kind, &field.order) {
                (FieldKind::Attr, Some(FieldOrder::Records(_))) => {
                    return Err(field.invalid(&model.name, "record comparator on an attribute"));
                }
                (FieldKind::One | FieldKind::Many, Some(FieldOrder::Values(_))) => {
                    return Err(field.invalid(&model.name, "value comparator on a relation"));
                }
                _ => {}
            }
            if field.kind == FieldKind::Attr {
                if field.on_add.is_some() || field.on_delete.is_some() {
                    return Err(field.invalid(&model.name, "add/delete hooks on an attribute"));
                }
            } else {
                if field.html {
                    return Err(field.invalid(&model.name, "markup flag on a relation"));
                }
                if !field.default.is_null() {
                    return Err(field.invalid(&model.name, "default value on a relation"));
                }
            }
        }
        Ok(())
    }

    fn resolve_listeners(model: &mut Model) -> Result<(), StoreError> {
        let index = &model.field_index;
        for listener in &mut model.listeners {
            for name in &listener.fields {
                let id = index
                    .get(name)
                    .copied()
                    .ok_or_else(|| StoreError::UnknownField {
                        model: model.name.clone(),
                        field: name.clone(),
                    })?;
                listener.watched.insert(id);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn model(&self, id: ModelId) -> &Model {
        &self.models[id.index()]
    }

    pub fn model_id(&self, name: &str) -> Result<ModelId, StoreError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter()
    }

    #[must_use]
    pub fn field(&self, model: ModelId, field: FieldId) -> &Field {
        self.model(model).field_def(field)
    }

    pub(crate) fn model_count(&self) -> usize {
        self.models.len()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Collects model declarations and assembles the store.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    models: Vec<Model>,
    options: StoreOptions,
}

impl SchemaBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    #[must_use]
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Assemble the schema. All schema errors surface here.
    pub fn build(self) -> Result<Store, StoreError> {
        let schema = Schema::assemble(self.models)?;
        Ok(Store::new(schema, self.options))
    }
}

// =============================================================================
// TESTS
// =============================================================================
