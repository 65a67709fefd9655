//! dbmx - a multi-tab SQL client shell.
//!
//! Reads one command per line from stdin and prints JSON results to stdout.

mod shell;

use dbmx_core::logging::{init_logging, LogConfig};
use dbmx_core::{Workspace, WorkspaceConfig};
use shell::Command;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let config = match WorkspaceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dbmx: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging before the workspace so startup is captured
    let _logging_guard = init_logging(LogConfig::new(config.log_dir.clone()));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting dbmx");

    let workspace = match Workspace::new(config) {
        Ok(workspace) => workspace,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open workspace");
            eprintln!("{:#}", shell::error_json(&e));
            return ExitCode::FAILURE;
        }
    };

    run_loop(&workspace);

    // Connections must be released before the process exits
    let report = workspace.shutdown();
    for (id, error) in &report.failures {
        eprintln!("dbmx: failed to close connection {id}: {error}");
    }

    tracing::info!(closed = report.closed, "dbmx stopped");
    ExitCode::SUCCESS
}

fn run_loop(workspace: &Workspace) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read from stdin");
                break;
            }
        };

        let output = match Command::parse(&line) {
            Ok(None) => continue,
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => match shell::execute(workspace, command) {
                Ok(value) => value,
                Err(e) => shell::error_json(&e),
            },
            Err(e) => shell::error_json(&e),
        };

        if writeln!(stdout, "{output:#}").and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
}
