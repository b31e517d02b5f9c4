//! # Operation Scripts
//!
//! A script is a JSON array of operations applied in order:
//!
//! ```json
//! [
//!   {"op": "insert", "model": "Thread", "data": {"id": 1, "messages": [{"id": 7}]}},
//!   {"op": "update", "model": "Thread", "find": 1, "data": {"subject": "hi"}},
//!   {"op": "delete", "model": "Message", "find": {"thread": 1, "id": 7}}
//! ]
//! ```
//!
//! `find` is whatever `Store::get` accepts: an identifying object or the
//! model's identity shorthand.

use crate::config::read_limited;
use crate::error::CliError;
use relstore_core::{InsertOptions, LocalId, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Largest script file accepted (100 MB).
pub const MAX_SCRIPT_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// One step of a script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Insert {
        model: String,
        data: Value,
        #[serde(default)]
        trusted: bool,
    },
    Update {
        model: String,
        find: Value,
        data: Value,
        #[serde(default)]
        trusted: bool,
    },
    Delete {
        model: String,
        find: Value,
    },
}

/// Counts of what a script did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScriptReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Deletes whose record did not exist.
    pub skipped: usize,
}

pub fn parse(text: &str) -> Result<Vec<Operation>, CliError> {
    Ok(serde_json::from_str(text)?)
}

pub fn load(path: &Path) -> Result<Vec<Operation>, CliError> {
    let ops = parse(&read_limited(path, MAX_SCRIPT_FILE_SIZE)?)?;
    debug!(path = %path.display(), operations = ops.len(), "loaded script");
    Ok(ops)
}

fn options(trusted: bool) -> InsertOptions {
    InsertOptions { trusted }
}

fn find(store: &Store, model: &str, key: &Value) -> Result<Option<LocalId>, CliError> {
    Ok(store.get(model, key.clone())?)
}

/// Apply `ops` in order. Stops at the first failing operation.
pub fn run(store: &mut Store, ops: &[Operation]) -> Result<ScriptReport, CliError> {
    let mut report = ScriptReport::default();
    for (index, op) in ops.iter().enumerate() {
        let failed = |e: CliError| CliError::Script {
            index,
            reason: e.to_string(),
        };
        match op {
            Operation::Insert {
                model,
                data,
                trusted,
            } => {
                let ids = store
                    .insert_with(model, data.clone(), options(*trusted))
                    .map_err(|e| failed(e.into()))?
                    .ids();
                report.inserted += ids.len();
            }
            Operation::Update {
                model,
                find: key,
                data,
                trusted,
            } => {
                let id = find(store, model, key).map_err(failed)?.ok_or_else(|| {
                    CliError::Script {
                        index,
                        reason: format!("no {model} matches {key}"),
                    }
                })?;
                store
                    .update_with(id, data.clone(), options(*trusted))
                    .map_err(|e| failed(e.into()))?;
                report.updated += 1;
            }
            Operation::Delete { model, find: key } => {
                match find(store, model, key).map_err(failed)? {
                    Some(id) => {
                        store.delete(id).map_err(|e| failed(e.into()))?;
                        report.deleted += 1;
                    }
                    None => {
                        debug!(index, %model, %key, "delete target absent");
                        report.skipped += 1;
                    }
                }
            }
        }
    }
    info!(
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        skipped = report.skipped,
        "script applied"
    );
    Ok(report)
}
