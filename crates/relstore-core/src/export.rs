//! # Snapshot Export
//!
//! Serializable view of the live store, ordered by model declaration and
//! then by canonical local id, so two equal stores export equal snapshots.
//!
//! Relations are rendered by record name (`Model_seq`); a to-one relation
//! becomes a string or `null`, a to-many relation an array. Derived fields
//! are brought up to date before they are exported.

use crate::schema::FieldKind;
use crate::store::Store;
use crate::{LocalId, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// SNAPSHOT TYPES
// =============================================================================

/// One record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Canonical name, `Model_seq`.
    pub id: String,
    /// Every local id, canonical first.
    pub local_ids: Vec<String>,
    pub object_ids: Vec<String>,
    /// Field values in declaration order.
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub records: Vec<RecordSnapshot>,
}

/// The whole store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub models: Vec<ModelSnapshot>,
}

impl StoreSnapshot {
    /// Total number of exported records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.models.iter().map(|model| model.records.len()).sum()
    }

    #[must_use]
    pub fn model(&self, name: &str) -> Option<&ModelSnapshot> {
        self.models.iter().find(|model| model.name == name)
    }
}

// =============================================================================
// EXPORT
// =============================================================================

impl Store {
    /// Export every live record.
    pub fn snapshot(&mut self) -> Result<StoreSnapshot, StoreError> {
        let names: Vec<String> = self
            .schema()
            .models()
            .map(|model| model.name().to_string())
            .collect();
        let mut models = Vec::with_capacity(names.len());
        for name in names {
            let mut records = Vec::new();
            for id in self.all(&name)? {
                // A derived field computed for an earlier record may have
                // merged or deleted this one.
                if self.exists(id) {
                    records.push(self.record_snapshot(id)?);
                }
            }
            models.push(ModelSnapshot { name, records });
        }
        Ok(StoreSnapshot { models })
    }

    /// Export one record.
    pub fn record_snapshot(&mut self, id: LocalId) -> Result<RecordSnapshot, StoreError> {
        let id = self.require(id)?;
        let schema = self.schema.clone();
        let model = schema.model(id.model);

        let mut fields = Map::new();
        for field in model.field_ids() {
            let def = model.field_def(field);
            let value = match def.kind {
                FieldKind::Attr => self.read_attr(id, field)?,
                FieldKind::One => self
                    .read_list(id, field)?
                    .first()
                    .map_or(Value::Null, |peer| Value::String(self.describe(*peer))),
                FieldKind::Many => Value::Array(
                    self.read_list(id, field)?
                        .into_iter()
                        .map(|peer| Value::String(self.describe(peer)))
                        .collect(),
                ),
            };
            fields.insert(def.name().to_string(), value);
        }

        let id = self.require(id)?;
        let local_ids = self
            .local_ids(id)?
            .into_iter()
            .map(|local| self.describe(local))
            .collect();
        Ok(RecordSnapshot {
            id: self.describe(id),
            local_ids,
            object_ids: self.object_ids(id)?,
            fields,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
