//! # Relstore CLI Module
//!
//! ## Available Commands
//!
//! - `check` - Assemble the schema and summarize its models
//! - `apply` - Run an operation script and print the resulting store
//! - `get` - Run an optional script, then look one record up by identity

mod commands;

use crate::error::CliError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Relstore - reactive relational record store
///
/// Builds a store from a TOML schema, feeds it JSON operations and prints
/// what it holds.
#[derive(Parser, Debug)]
#[command(name = "relstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML schema file
    #[arg(short = 'S', long, global = true, default_value = "schema.toml")]
    pub schema: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the schema and summarize its models
    Check,

    /// Apply an operation script and print the snapshot
    Apply {
        /// Path to the JSON operation script
        #[arg(short, long)]
        script: PathBuf,
    },

    /// Look a record up by identity data
    Get {
        /// Script to apply before the lookup
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Model to search
        #[arg(short, long)]
        model: String,

        /// Identity data as JSON (object or shorthand value)
        #[arg(short, long)]
        find: String,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), CliError> {
    let json_mode = cli.json_mode;
    let verbose = cli.verbose;

    match cli.command {
        Some(Commands::Apply { script }) => cmd_apply(&cli.schema, &script, json_mode, verbose),
        Some(Commands::Get {
            script,
            model,
            find,
        }) => cmd_get(&cli.schema, script.as_deref(), &model, &find, json_mode),
        Some(Commands::Check) | None => cmd_check(&cli.schema, json_mode),
    }
}
