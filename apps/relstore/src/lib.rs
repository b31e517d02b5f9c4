//! # relstore
//!
//! Command-line front end of the record store - THE BINARY.
//!
//! - `config`: TOML schema files turned into a `Store`
//! - `script`: JSON operation scripts applied to a store
//! - `cli`: clap commands printing text or JSON

pub mod cli;
pub mod config;
pub mod error;
pub mod script;

pub use config::SchemaFile;
pub use error::CliError;
pub use script::{Operation, ScriptReport};
