use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Tony Kan, Ted Yu, William A. Goddard III, Victor Wai Tak Kam",
    version,
    about = "FFDispatch CLI - Evaluate molecular configurations through concurrent force-field dispatchers.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads used to submit replicas concurrently.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate energies and forces of a configuration read from an XYZ file.
    Evaluate(EvaluateArgs),
    /// Validate a force-field configuration file and print the resolved settings.
    Check(CheckArgs),
}

/// Configuration source shared by every subcommand.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Path to the force-field configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the polling latency in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub latency: Option<f64>,

    /// Override `forcefield.threaded` from the config file.
    #[command(flatten)]
    pub threading: Threading,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S forcefield.latency=0.005
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Mutually exclusive flags selecting how the dispatcher is polled.
#[derive(Args, Debug, Clone, Copy, Default)]
#[group(required = false, multiple = false)]
pub struct Threading {
    /// Poll the request queue from a background thread.
    #[arg(long)]
    pub threaded: bool,
    /// Poll the request queue inline on every submission.
    #[arg(long)]
    pub serial: bool,
}

/// Arguments for the `evaluate` subcommand.
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Path to the input configuration in XYZ format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Number of replicas of the input configuration to evaluate.
    #[arg(short = 'n', long, default_value_t = 1, value_name = "INT")]
    pub replicas: usize,

    /// Orthorhombic cell lengths, e.g. `--cell 20,20,20`. Defaults to a non-periodic box.
    #[arg(long, value_name = "A,B,C", value_parser = parse_cell_lengths)]
    pub cell: Option<[f64; 3]>,
}

/// Arguments for the `check` subcommand.
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

fn parse_cell_lengths(value: &str) -> Result<[f64; 3], String> {
    let lengths = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", part.trim()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    <[f64; 3]>::try_from(lengths)
        .map_err(|found| format!("expected three comma-separated lengths, got {}", found.len()))
}
