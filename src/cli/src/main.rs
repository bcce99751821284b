//! Kiln CLI entry point.

use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::commands::{dispatch, exit_code, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(cli.colors || std::io::stdout().is_terminal())
            .init();
    }

    if let Err(e) = dispatch(cli).await {
        let code = exit_code(e.as_ref());
        if code != 2 {
            eprintln!("Error: {e}");
        }
        std::process::exit(code);
    }
}
