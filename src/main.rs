//! Binary entry point for the unravel CLI.
//!
//! ## Usage
//!
//! ```bash
//! # Dump a top-level definition with everything it depends on
//! unravel dump --file model.py --name train
//!
//! # Same, as a JSON report with per-node sources
//! unravel dump --file model.py --name train --json
//!
//! # Inline the source of selected imported modules
//! unravel dump --file model.py --name train --full-dump helpers
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use unravel::error::{OutputErrorCode, UnravelError};
use unravel::graph::{self, name_from_ast_node, BuildOptions};
use unravel::{NullIntrospector, Session};

// ============================================================================
// CLI Structure
// ============================================================================

/// Reconstruct the minimal standalone source for a Python definition.
#[derive(Parser, Debug)]
#[command(name = "unravel", version, about = "Minimal source reconstruction for Python objects")]
struct Cli {
    /// Log level for tracing output.
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

/// Log level for tracing output.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Build and print the dependency dump for one name.
    Dump {
        /// Python source file to read.
        #[arg(long)]
        file: PathBuf,
        /// Name to dump (default: the name bound by the file's last
        /// statement).
        #[arg(long)]
        name: Option<String>,
        /// Module name the file is registered under.
        #[arg(long, default_value = "__main__")]
        module: String,
        /// Emit a JSON report with per-node sources instead of plain text.
        #[arg(long)]
        json: bool,
        /// Fail on the first unresolvable name instead of dropping it.
        #[arg(long)]
        strict: bool,
        /// Module whose imports are inlined from source. Repeatable.
        #[arg(long = "full-dump")]
        full_dump: Vec<String>,
    },
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Serialize)]
struct NodeReport {
    name: String,
    scope: String,
    source: String,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    module: String,
    name: String,
    nodes: Vec<NodeReport>,
    dump: String,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(OutputErrorCode::from(&err).code())
        }
    }
}

/// Initialize tracing subscriber.
fn init_tracing(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_tracing_level().to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Execute the CLI command.
fn execute(cli: Cli) -> Result<(), UnravelError> {
    match cli.command {
        Command::Dump {
            file,
            name,
            module,
            json,
            strict,
            full_dump,
        } => execute_dump(&file, name.as_deref(), &module, json, strict, full_dump),
    }
}

// ============================================================================
// Command Executors
// ============================================================================

fn execute_dump(
    file: &std::path::Path,
    name: Option<&str>,
    module: &str,
    json: bool,
    strict: bool,
    full_dump: Vec<String>,
) -> Result<(), UnravelError> {
    let source = std::fs::read_to_string(file).map_err(|e| {
        UnravelError::invalid_args(format!("cannot read {}: {}", file.display(), e))
    })?;

    let session = Session::new();
    session.register_module(module, source.as_str());

    let name = match name {
        Some(name) => name.to_string(),
        None => default_name(&session, &source)?,
    };

    let options = BuildOptions {
        strict,
        full_dump_module_names: full_dump,
    };
    let graph =
        graph::build_codegraph_for_name(&session, &NullIntrospector, module, &name, &options)?;
    let dump = graph.dumps()?;

    if json {
        let nodes = graph
            .nodes()
            .values()
            .map(|node| NodeReport {
                name: node.name.name.clone(),
                scope: node.name.scope.to_string(),
                source: node.source.clone(),
            })
            .collect();
        let report = DumpReport {
            module: module.to_string(),
            name,
            nodes,
            dump,
        };
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|e| UnravelError::internal(e.to_string()))?;
        println!("{}", rendered);
    } else {
        print!("{}", dump);
    }
    let _ = io::stdout().flush();
    Ok(())
}

/// The name bound by the file's last statement, used when `--name` is
/// omitted.
fn default_name(session: &Session, source: &str) -> Result<String, UnravelError> {
    let parsed = session.parse(source)?;
    let Some(last) = parsed.last() else {
        return Err(UnravelError::invalid_args("source file is empty"));
    };
    name_from_ast_node(last)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod cli_parsing {
        use super::*;

        #[test]
        fn parse_dump_defaults() {
            let args = ["unravel", "dump", "--file", "model.py", "--name", "train"];
            let cli = Cli::try_parse_from(args).unwrap();
            match cli.command {
                Command::Dump {
                    file,
                    name,
                    module,
                    json,
                    strict,
                    full_dump,
                } => {
                    assert_eq!(file, PathBuf::from("model.py"));
                    assert_eq!(name.as_deref(), Some("train"));
                    assert_eq!(module, "__main__");
                    assert!(!json);
                    assert!(!strict);
                    assert!(full_dump.is_empty());
                }
            }
        }

        #[test]
        fn parse_dump_without_name() {
            let args = ["unravel", "dump", "--file", "model.py"];
            let cli = Cli::try_parse_from(args).unwrap();
            match cli.command {
                Command::Dump { name, .. } => assert!(name.is_none()),
            }
        }

        #[test]
        fn parse_dump_full_options() {
            let args = [
                "unravel",
                "dump",
                "--file",
                "model.py",
                "--name",
                "train",
                "--module",
                "trainer",
                "--json",
                "--strict",
                "--full-dump",
                "helpers",
                "--full-dump",
                "config",
            ];
            let cli = Cli::try_parse_from(args).unwrap();
            match cli.command {
                Command::Dump {
                    module,
                    json,
                    strict,
                    full_dump,
                    ..
                } => {
                    assert_eq!(module, "trainer");
                    assert!(json);
                    assert!(strict);
                    assert_eq!(full_dump, vec!["helpers", "config"]);
                }
            }
        }

        #[test]
        fn missing_file_flag_is_rejected() {
            let args = ["unravel", "dump", "--name", "train"];
            assert!(Cli::try_parse_from(args).is_err());
        }
    }

    mod default_names {
        use super::*;

        #[test]
        fn last_statement_names_the_dump() {
            let session = Session::new();
            let name = default_name(&session, "x = 1\n\ndef train():\n    return x\n").unwrap();
            assert_eq!(name, "train");
        }

        #[test]
        fn unnameable_last_statement_errors() {
            let session = Session::new();
            assert!(default_name(&session, "print(1)\n").is_err());
        }
    }
}
