//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;

/// Run a built-in function over a batch of items on a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "procjob")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a function to every item and print the results as a JSON array.
    Run(RunArgs),

    /// List the built-in functions.
    Functions,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "procjob",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Built-in function to apply (see `procjob functions`).
    pub func: String,

    /// Items, parsed as JSON where possible and taken as strings otherwise.
    #[arg(value_parser = parse_value, allow_negative_numbers = true)]
    pub items: Vec<Value>,

    /// Extra argument passed after each item (repeatable, same parsing as items).
    #[arg(short, long = "arg", value_parser = parse_value, allow_negative_numbers = true)]
    pub args: Vec<Value>,

    /// Number of worker processes [default: 4].
    #[arg(short, long)]
    pub processes: Option<usize>,

    /// Per-task timeout in seconds [default: 15 hours].
    #[arg(short, long, value_parser = parse_seconds)]
    pub timeout: Option<Duration>,

    /// Record failures as null instead of aborting.
    #[arg(short, long)]
    pub suppress: bool,

    /// Let workers run pools of their own.
    #[arg(long)]
    pub allow_nested: bool,

    /// Replace each worker after this many tasks.
    #[arg(long)]
    pub max_tasks_per_worker: Option<usize>,

    /// Run in this process instead of on a worker pool.
    #[arg(long)]
    pub single: bool,

    /// Log job start and finish.
    #[arg(long)]
    pub debug: bool,
}

fn parse_value(s: &str) -> Result<Value, Infallible> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    procjob::config::parse_timeout(s)
        .ok_or_else(|| format!("'{}' is not a non-negative number of seconds", s))
}
