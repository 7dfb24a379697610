//! luadoop CLI - run map/reduce jobs declared in a Lua setup script
//!
//! The first positional argument is the job setup script; everything after it
//! is passed to the script's `luadoop.run` function.

use clap::Parser;
use std::path::PathBuf;
use std::process;

use luadoop::host::Configuration;
use luadoop::runner::{JobRunner, RunnerError};

#[derive(Parser)]
#[command(name = "luadoop")]
#[command(version, about = "Run map/reduce jobs written in Lua", long_about = None)]
struct Cli {
    /// YAML file with base job configuration
    #[arg(short, long)]
    conf: Option<PathBuf>,

    /// Configuration override, applied after the setup script
    #[arg(short = 'D', value_name = "KEY=VALUE")]
    define: Vec<String>,

    /// Print the declared jobs as YAML instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Debug logging and a JSON report per finished job
    #[arg(short, long)]
    verbose: bool,

    /// Job setup script
    setup_script: PathBuf,

    /// Arguments handed to the setup script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    job_args: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_runner(cli: &Cli) -> Result<JobRunner, RunnerError> {
    let base = match &cli.conf {
        Some(path) => Configuration::load_from_file(path)?,
        None => Configuration::new(),
    };

    let mut overrides = Configuration::new();
    for assignment in &cli.define {
        overrides.apply_override(assignment)?;
    }

    Ok(JobRunner::new(&cli.setup_script, cli.job_args.clone())
        .with_base_configuration(base)
        .with_overrides(overrides))
}

fn execute(cli: &Cli) -> Result<(), RunnerError> {
    let runner = build_runner(cli)?;

    if cli.dry_run {
        let job_set = runner.load_job_set()?;
        match serde_yaml::to_string(&job_set) {
            Ok(yaml) => print!("{}", yaml),
            Err(e) => eprintln!("Failed to render job definitions: {}", e),
        }
        return Ok(());
    }

    let reports = runner.run_jobs()?;
    for report in &reports {
        println!(
            "✓ {} finished: {} map task(s), {} reduce task(s), output in {}",
            report.job_name, report.map_tasks, report.reduce_tasks, report.output_path
        );
        if cli.verbose {
            match serde_json::to_string_pretty(report) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to render job report: {}", e),
            }
        }
    }
    Ok(())
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = execute(&cli) {
        tracing::error!(error = %err, "luadoop failed");
        eprintln!("✗ {}", err);
        process::exit(err.exit_code());
    }
}
