//! procjob - run built-in functions over a batch of items on a worker pool.

mod cli;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use procjob::logging::{self, LogConfig};
use procjob::{Job, JobConfig, JobError, Registry, builtins};
use serde_json::Value;

use cli::{Cli, Commands, RunArgs};

/// Exit status after an interrupt, as a shell reports death by SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

/// Program entry point.
///
/// Worker processes are this binary re-executed, so worker mode is checked before
/// the command line is even parsed.
fn main() {
    let registry = builtins::registry();
    procjob::run_if_worker(&registry);

    let cli = Cli::parse();
    if cli.no_color {
        owo_colors::set_override(false);
    }
    // The job's start/finish pair is logged at info level.
    let verbose = match &cli.command {
        Commands::Run(args) if args.debug => cli.verbose.max(1),
        _ => cli.verbose,
    };
    logging::init(LogConfig::from_verbosity(verbose, cli.quiet).with_env_overrides());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(registry, args),
        Commands::Functions => cmd_functions(&registry),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        let interrupted = e
            .downcast_ref::<JobError>()
            .is_some_and(JobError::is_interrupt);
        std::process::exit(if interrupted { EXIT_INTERRUPTED } else { 1 });
    }
}

fn cmd_run(registry: Registry, args: &RunArgs) -> Result<()> {
    let mut config = JobConfig::default()
        .with_env_overrides()
        .with_allow_nested_pools(args.allow_nested)
        .with_max_tasks_per_worker(args.max_tasks_per_worker)
        .with_debug(args.debug);
    if let Some(processes) = args.processes {
        config = config.with_processes(processes);
    }
    if let Some(timeout) = args.timeout {
        config = config.with_timeout(timeout);
    }
    if args.suppress {
        config = config.with_suppress_worker_failures(true);
    }

    let job = Job::new(registry, args.func.as_str())
        .with_items(args.items.iter().cloned())
        .with_args(args.args.clone())
        .with_config(config);

    let results: Vec<Option<Value>> = if args.single {
        job.run_single_processed()?
    } else {
        job.run_multi_processed()?
    };

    println!("{}", serde_json::to_string(&results)?);
    Ok(())
}

fn cmd_functions(registry: &Registry) -> Result<()> {
    for name in registry.names() {
        let description = builtins::FUNCTIONS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, d)| *d)
            .unwrap_or_default();
        println!(
            "{}  {}",
            format!("{:<12}", name).if_supports_color(Stdout, |text| text.bold()),
            description
        );
    }
    Ok(())
}
