//! # Integrity Check
//!
//! Structural invariants that must hold whenever no update cycle is open:
//!
//! 1. Aliases point at live records that list them among their local ids.
//! 2. Model tables hold exactly the canonical ids of live records.
//! 3. A to-one relation holds at most one id.
//! 4. Relation members are canonical ids of live records of the target model.
//! 5. Declared inverse pairs are symmetric.
//! 6. Usage counts equal actual occurrences in the referencing lists.
//! 7. The object-id index and the records' object ids agree.

use crate::record::FieldValue;
use crate::schema::FieldKind;
use crate::store::Store;
use crate::{FieldId, LocalId, StoreError};
use std::collections::BTreeSet;

fn violation(message: String) -> StoreError {
    StoreError::Integrity(message)
}

impl Store {
    /// Verify every structural invariant; the first violation is returned.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        if self.in_update() {
            return Err(violation("check requested inside an update cycle".into()));
        }
        self.check_aliases()?;
        self.check_tables()?;
        self.check_relations()?;
        self.check_usage()?;
        self.check_object_index()
    }

    fn check_aliases(&self) -> Result<(), StoreError> {
        for (&canonical, record) in &self.records {
            if record.ids.first() != Some(&canonical) {
                return Err(violation(format!(
                    "{} is not first among its own local ids",
                    self.describe(canonical)
                )));
            }
            for id in &record.ids {
                if self.aliases.get(id) != Some(&canonical) {
                    return Err(violation(format!(
                        "local id {id:?} of {} is not aliased to it",
                        self.describe(canonical)
                    )));
                }
            }
        }
        for (alias, canonical) in &self.aliases {
            let owned = self
                .records
                .get(canonical)
                .is_some_and(|record| record.ids.contains(alias));
            if !owned {
                return Err(violation(format!("dangling alias {alias:?}")));
            }
        }
        Ok(())
    }

    fn check_tables(&self) -> Result<(), StoreError> {
        for model in self.schema.models() {
            let live: BTreeSet<LocalId> = self
                .records
                .keys()
                .filter(|id| id.model == model.id())
                .copied()
                .collect();
            if self.tables[model.id().index()].members != live {
                return Err(violation(format!(
                    "table of {} disagrees with live records",
                    model.name()
                )));
            }
        }
        Ok(())
    }

    fn check_relations(&self) -> Result<(), StoreError> {
        for (&owner, record) in &self.records {
            let model = self.schema.model(owner.model);
            for field in model.field_ids() {
                let def = model.field_def(field);
                let Some(list) = record.list(field) else {
                    continue;
                };
                let at = || format!("{}.{}", self.describe(owner), def.name);
                if def.kind == FieldKind::One && list.len() > 1 {
                    return Err(violation(format!("{} holds {} records", at(), list.len())));
                }
                for peer in list.iter() {
                    if !self.records.contains_key(&peer) || Some(peer.model) != def.target_model {
                        return Err(violation(format!("{} holds invalid {peer:?}", at())));
                    }
                    if let Some(back) = def.inverse_field {
                        if !self.contains(peer, back, owner) {
                            return Err(violation(format!(
                                "{} holds {} but not the other way round",
                                at(),
                                self.describe(peer)
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_usage(&self) -> Result<(), StoreError> {
        for (&id, record) in &self.records {
            for (owner, field, count) in record.usage.entries() {
                let actual = self.occurrences(owner, field, id);
                if actual != count {
                    return Err(violation(format!(
                        "{} records {count} uses by {} but {actual} exist",
                        self.describe(id),
                        self.describe(owner)
                    )));
                }
            }
        }
        for (&owner, record) in &self.records {
            for (index, slot) in record.fields.iter().enumerate() {
                let FieldValue::Relation(list) = &slot.value else {
                    continue;
                };
                let field = FieldId(index as u32);
                for peer in list.iter() {
                    let recorded = self
                        .records
                        .get(&peer)
                        .map_or(0, |peer| peer.usage.count(owner, field));
                    if recorded != list.count(peer) {
                        return Err(violation(format!(
                            "use of {} by {} is not recorded",
                            self.describe(peer),
                            self.describe(owner)
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_object_index(&self) -> Result<(), StoreError> {
        for (key, id) in &self.object_index {
            let owned = self
                .records
                .get(id)
                .is_some_and(|record| record.object_ids.contains(key));
            if !owned {
                return Err(violation(format!("object id {key} points at {id:?}")));
            }
        }
        for (&id, record) in &self.records {
            for key in &record.object_ids {
                if self.object_index.get(key) != Some(&id) {
                    return Err(violation(format!(
                        "object id {key} of {} is not indexed",
                        self.describe(id)
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
