//! Schema file, script and command-line tests for the relstore binary.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use clap::Parser;
use relstore::cli::{self, Cli, Commands};
use relstore::config::{IdentityClause, KindConfig, read_limited};
use relstore::{CliError, SchemaFile, script};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};

const MAIL_SCHEMA: &str = r#"
[store]
max_identity_candidates = 50

[[model]]
name = "Thread"
identity = ["id"]

[[model.field]]
name = "id"

[[model.field]]
name = "messages"
kind = "many"
target = "Message"
inverse = "thread"
sort = "-date"

[[model]]
name = "Message"
identity = [["thread", "id"]]

[[model.field]]
name = "thread"
kind = "one"
target = "Thread"
inverse = "messages"

[[model.field]]
name = "id"

[[model.field]]
name = "date"

[[model.field]]
name = "body"
html = true

[[model.field]]
name = "unread"
default = true

[[model]]
name = "Contact"
identity = ["email", "phone"]

[[model.field]]
name = "email"

[[model.field]]
name = "phone"

[[model.field]]
name = "labels"
sort = "asc"
"#;

const MAIL_SCRIPT: &str = r#"[
    {"op": "insert", "model": "Message", "data": [
        {"thread": 1, "id": 1, "date": 5, "body": "<b>hi</b>"},
        {"thread": 1, "id": 2, "date": 9},
        {"thread": 1, "id": 3, "date": 1}
    ]},
    {"op": "insert", "model": "Contact", "data": {"email": "a@x", "labels": ["work", "home"]}},
    {"op": "insert", "model": "Contact", "data": {"phone": "555"}},
    {"op": "update", "model": "Contact", "find": {"email": "a@x"}, "data": {"phone": "555"}},
    {"op": "delete", "model": "Message", "find": {"thread": 1, "id": 3}}
]"#;

fn write_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

// =============================================================================
// SCHEMA FILE TESTS
// =============================================================================

#[test]
fn test_schema_file_parses() {
    let schema = SchemaFile::parse(MAIL_SCHEMA).unwrap();

    assert_eq!(schema.store.max_identity_candidates, 50);
    assert_eq!(schema.models.len(), 3);
    assert_eq!(
        schema.models[1].identity,
        vec![IdentityClause::All(vec!["thread".into(), "id".into()])]
    );
    assert_eq!(schema.models[1].fields[0].kind, KindConfig::One);
    assert_eq!(schema.models[1].fields[1].kind, KindConfig::Attr);
}

#[test]
fn test_schema_file_loads_from_disk() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(MAIL_SCHEMA.as_bytes()).unwrap();

    let store = SchemaFile::load(file.path()).unwrap().build().unwrap();
    assert_eq!(store.options().max_identity_candidates, 50);
    assert_eq!(store.schema().models().count(), 3);

    let thread = store.schema().model(store.schema().model_id("Thread").unwrap());
    let messages = thread.field_def(thread.field_id("messages").unwrap());
    assert!(messages.is_eager());
}

#[test]
fn test_missing_schema_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = SchemaFile::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(CliError::Io { .. })));
}

#[test]
fn test_oversized_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "big.toml", "# twelve bytes");
    assert!(matches!(
        read_limited(&path, 4),
        Err(CliError::TooLarge { limit: 4, .. })
    ));
}

#[test]
fn test_schema_errors_surface_as_store_errors() {
    let result = SchemaFile::parse(
        r#"
        [[model]]
        name = "A"
        [[model.field]]
        name = "b"
        kind = "one"
        target = "Missing"
        "#,
    )
    .unwrap()
    .build();
    assert!(matches!(result, Err(CliError::Store(_))));
}

#[test]
fn test_bad_sort_spec_is_rejected() {
    let result = SchemaFile::parse(
        r#"
        [[model]]
        name = "A"
        [[model.field]]
        name = "x"
        sort = "sideways"
        "#,
    )
    .unwrap()
    .build();
    assert!(matches!(result, Err(CliError::Config(_))));
}

#[test]
fn test_singleton_model() {
    let mut store = SchemaFile::parse(
        r#"
        [[model]]
        name = "Settings"
        singleton = true
        [[model.field]]
        name = "theme"
        default = "light"
        "#,
    )
    .unwrap()
    .build()
    .unwrap();

    let a = store.insert("Settings", json!({})).unwrap();
    let b = store.insert("Settings", json!({"theme": "dark"})).unwrap();
    assert_eq!(a, b);
    assert_eq!(store.value(a, "theme").unwrap(), json!("dark"));
}

// =============================================================================
// SCRIPT TESTS
// =============================================================================

#[test]
fn test_script_builds_expected_store() {
    let mut store = SchemaFile::parse(MAIL_SCHEMA).unwrap().build().unwrap();
    let ops = script::parse(MAIL_SCRIPT).unwrap();

    let report = script::run(&mut store, &ops).unwrap();
    assert_eq!(report.inserted, 5);
    assert_eq!(report.updated, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.skipped, 0);
    store.check_integrity().unwrap();

    let snapshot = store.snapshot().unwrap();
    let thread = &snapshot.model("Thread").unwrap().records[0];
    assert_eq!(thread.fields["messages"], json!(["Message_2", "Message_1"]));

    let messages = &snapshot.model("Message").unwrap().records;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].fields["thread"], json!("Thread_1"));
    assert_eq!(messages[0].fields["unread"], json!(true));
    assert_eq!(messages[0].fields["body"], json!("&lt;b&gt;hi&lt;/b&gt;"));

    let contacts = &snapshot.model("Contact").unwrap().records;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].local_ids.len(), 2);
    assert_eq!(contacts[0].fields["labels"], json!(["home", "work"]));
}

#[test]
fn test_trusted_insert_keeps_markup() {
    let mut store = SchemaFile::parse(MAIL_SCHEMA).unwrap().build().unwrap();
    let ops = script::parse(
        r#"[{"op": "insert", "model": "Message", "trusted": true,
             "data": {"thread": 1, "id": 1, "body": "<b>hi</b>"}}]"#,
    )
    .unwrap();
    script::run(&mut store, &ops).unwrap();

    let id = store.get("Message", json!({"thread": 1, "id": 1})).unwrap().unwrap();
    assert_eq!(store.value(id, "body").unwrap(), json!("<b>hi</b>"));
}

#[test]
fn test_failing_operation_reports_index() {
    let mut store = SchemaFile::parse(MAIL_SCHEMA).unwrap().build().unwrap();
    let ops = script::parse(
        r#"[
            {"op": "insert", "model": "Contact", "data": {"email": "a@x"}},
            {"op": "insert", "model": "Ghost", "data": {}}
        ]"#,
    )
    .unwrap();
    match script::run(&mut store, &ops) {
        Err(CliError::Script { index, reason }) => {
            assert_eq!(index, 1);
            assert!(reason.contains("Ghost"));
        }
        other => panic!("expected script error, got {:?}", other),
    }
}

// =============================================================================
// COMMAND-LINE TESTS
// =============================================================================

#[test]
fn test_cli_defaults() {
    let cli = Cli::try_parse_from(["relstore"]).unwrap();
    assert_eq!(cli.schema, Path::new("schema.toml"));
    assert!(!cli.json_mode);
    assert!(cli.command.is_none());
}

#[test]
fn test_cli_get_arguments() {
    let cli = Cli::try_parse_from([
        "relstore",
        "get",
        "--model",
        "Contact",
        "--find",
        r#"{"email": "a@x"}"#,
        "-S",
        "mail.toml",
        "--json-mode",
    ])
    .unwrap();

    assert_eq!(cli.schema, Path::new("mail.toml"));
    assert!(cli.json_mode);
    match cli.command {
        Some(Commands::Get {
            script,
            model,
            find,
        }) => {
            assert!(script.is_none());
            assert_eq!(model, "Contact");
            assert_eq!(cli::parse_find(&find), json!({"email": "a@x"}));
        }
        other => panic!("expected get, got {:?}", other),
    }
}

#[test]
fn test_cli_apply_requires_script() {
    assert!(Cli::try_parse_from(["relstore", "apply"]).is_err());
}

#[test]
fn test_commands_run_against_files() {
    let dir = TempDir::new().unwrap();
    let schema = write_file(&dir, "schema.toml", MAIL_SCHEMA);
    let ops = write_file(&dir, "ops.json", MAIL_SCRIPT);

    cli::cmd_check(&schema, true).unwrap();
    cli::cmd_apply(&schema, &ops, false, true).unwrap();
    cli::cmd_get(&schema, Some(ops.as_path()), "Contact", r#"{"phone": "555"}"#, true).unwrap();
    cli::cmd_get(&schema, None, "Thread", "1", false).unwrap();

    let missing = dir.path().join("missing.json");
    assert!(matches!(
        cli::cmd_apply(&schema, &missing, true, false),
        Err(CliError::Io { .. })
    ));
}
