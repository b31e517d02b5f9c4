//! # Relstore - Record Store CLI
//!
//! ## Usage
//!
//! ```bash
//! # Validate a schema
//! relstore -S schema.toml check
//!
//! # Apply a script and print the resulting records
//! relstore -S schema.toml apply --script ops.json -v
//!
//! # Look a record up after applying a script
//! relstore -S schema.toml get --script ops.json --model Contact --find '{"email": "a@x"}'
//! ```

use clap::Parser;
use relstore::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // RELSTORE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("RELSTORE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relstore=info,relstore_core=info".into());

    // Logs go to stderr so JSON output on stdout stays parseable.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  relstore v{}
  reactive relational record store
"#,
        env!("CARGO_PKG_VERSION")
    );
}
