//! # CLI Command Implementations
//!
//! Every command rebuilds the store from the schema file; nothing is kept
//! between runs.

use crate::config::SchemaFile;
use crate::error::CliError;
use crate::script::{self, ScriptReport};
use relstore_core::{FieldKind, RecordSnapshot, Store, StoreSnapshot};
use serde_json::Value;
use std::path::Path;

fn load_store(schema: &Path) -> Result<Store, CliError> {
    let store = SchemaFile::load(schema)?.build()?;
    tracing::info!(
        "Loaded schema {:?} ({} models)",
        schema,
        store.schema().models().count()
    );
    Ok(store)
}

fn print_json(output: &impl serde::Serialize) {
    println!("{}", serde_json::to_string_pretty(output).unwrap_or_default());
}

/// `--find` text as identity data. Text that is not JSON is taken as a
/// string, so `--find ann` works as well as `--find '"ann"'`.
#[must_use]
pub fn parse_find(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn print_record(record: &RecordSnapshot) {
    println!("{}", record.id);
    if record.local_ids.len() > 1 {
        println!("  aliases:    {}", record.local_ids[1..].join(", "));
    }
    for object_id in &record.object_ids {
        println!("  identity:   {}", object_id);
    }
    for (name, value) in &record.fields {
        println!("  {:<12}{}", name, value);
    }
}

// =============================================================================
// CHECK COMMAND
// =============================================================================

fn kind_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Attr => "attr",
        FieldKind::One => "one",
        FieldKind::Many => "many",
    }
}

/// Assemble the schema and summarize it.
pub fn cmd_check(schema: &Path, json_mode: bool) -> Result<(), CliError> {
    let store = load_store(schema)?;

    if json_mode {
        let models: Vec<Value> = store
            .schema()
            .models()
            .map(|model| {
                let fields: Vec<Value> = model
                    .fields()
                    .map(|field| {
                        serde_json::json!({
                            "name": field.name(),
                            "kind": kind_label(field.kind()),
                            "target": field.target(),
                            "inverse": field.inverse_name(),
                            "eager": field.is_eager(),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "name": model.name(),
                    "singleton": model.is_singleton(),
                    "identity": model.identity_clauses(),
                    "fields": fields,
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "schema": schema.to_string_lossy(),
            "valid": true,
            "models": models,
        }));
        return Ok(());
    }

    println!("Relstore Schema");
    println!("===============");
    println!("Schema: {:?}", schema);
    println!();
    for model in store.schema().models() {
        let identity = if model.is_singleton() {
            "singleton".to_string()
        } else {
            model
                .identity_clauses()
                .iter()
                .map(|clause| clause.join(" + "))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        println!("{}  [{}]", model.name(), identity);
        for field in model.fields() {
            let mut line = format!("  {:<12}{}", field.name(), kind_label(field.kind()));
            if let Some(target) = field.target() {
                line.push_str(&format!(" -> {}", target));
            }
            if let Some(inverse) = field.inverse_name() {
                line.push_str(&format!(" (inverse {})", inverse));
            }
            if field.is_eager() {
                line.push_str(" eager");
            }
            println!("{}", line);
        }
    }

    Ok(())
}

// =============================================================================
// APPLY COMMAND
// =============================================================================

/// Run a script, verify the store and print what it holds.
pub fn cmd_apply(
    schema: &Path,
    script_path: &Path,
    json_mode: bool,
    verbose: bool,
) -> Result<(), CliError> {
    let mut store = load_store(schema)?;
    let ops = script::load(script_path)?;
    let report = script::run(&mut store, &ops)?;
    store.check_integrity()?;
    let snapshot = store.snapshot()?;

    if json_mode {
        print_json(&serde_json::json!({
            "report": report,
            "snapshot": snapshot,
        }));
        return Ok(());
    }

    print_apply(&report, &snapshot, verbose);
    Ok(())
}

fn print_apply(report: &ScriptReport, snapshot: &StoreSnapshot, verbose: bool) {
    println!("Relstore Apply");
    println!("==============");
    println!("Inserted: {}", report.inserted);
    println!("Updated:  {}", report.updated);
    println!("Deleted:  {}", report.deleted);
    if report.skipped > 0 {
        println!("Skipped:  {}", report.skipped);
    }
    println!();
    println!("Records: {}", snapshot.record_count());
    for model in &snapshot.models {
        println!("  {:<12}{}", model.name, model.records.len());
    }

    if verbose {
        for record in snapshot.models.iter().flat_map(|model| &model.records) {
            println!();
            print_record(record);
        }
    }
}

// =============================================================================
// GET COMMAND
// =============================================================================

/// Look a record up by identity, optionally after running a script.
pub fn cmd_get(
    schema: &Path,
    script_path: Option<&Path>,
    model: &str,
    find: &str,
    json_mode: bool,
) -> Result<(), CliError> {
    let mut store = load_store(schema)?;
    if let Some(path) = script_path {
        let ops = script::load(path)?;
        script::run(&mut store, &ops)?;
    }

    let key = parse_find(find);
    let found = match store.get(model, key.clone())? {
        Some(id) => Some(store.record_snapshot(id)?),
        None => None,
    };

    if json_mode {
        print_json(&serde_json::json!({
            "model": model,
            "find": key,
            "record": found,
        }));
        return Ok(());
    }

    match found {
        Some(record) => print_record(&record),
        None => println!("No {} matches {}", model, key),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn find_accepts_json_or_bare_text() {
        assert_eq!(parse_find(r#"{"id": 1}"#), json!({"id": 1}));
        assert_eq!(parse_find("42"), json!(42));
        assert_eq!(parse_find("ann"), json!("ann"));
    }

    #[test]
    fn kind_labels_match_schema_file_names() {
        assert_eq!(kind_label(FieldKind::Attr), "attr");
        assert_eq!(kind_label(FieldKind::One), "one");
        assert_eq!(kind_label(FieldKind::Many), "many");
    }
}
