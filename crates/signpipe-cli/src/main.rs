//! signpipe CLI entry point.
//!
//! Usage:
//!   signpipe 0 1 1 2 3 5 8          # Sign integers given as arguments
//!   echo 0 1 2 | signpipe           # Sign whitespace-separated integers from stdin
//!   signpipe --json 1 2 3           # Print the full batch report as JSON
//!   signpipe --instant 1 2 3        # No simulated signer latency

use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use signpipe_kernel::{PipelineConfig, SigningKernel};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

/// What the command line asked for.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Version,
    Sign(Options),
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    config: Option<PathBuf>,
    json: bool,
    instant: bool,
    /// Integers from the command line; empty means read stdin.
    batch: Vec<i64>,
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();

    match parse_args(&args)? {
        Command::Help => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        Command::Version => {
            println!("signpipe {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Sign(mut options) => {
            if options.batch.is_empty() {
                let mut input = String::new();
                std::io::stdin()
                    .read_to_string(&mut input)
                    .context("Failed to read integers from stdin")?;
                options.batch = parse_batch(&input)?;
            }
            run_sign(options)
        }
    }
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut options = Options::default();
    let mut args = args.iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-V" => return Ok(Command::Version),
            "--json" => options.json = true,
            "--instant" => options.instant = true,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                options.config = Some(PathBuf::from(path));
            }
            "--" => {
                for value in args.by_ref() {
                    options.batch.push(parse_item(value)?);
                }
            }
            arg if arg.starts_with("--config=") => {
                options.config = Some(PathBuf::from(&arg["--config=".len()..]));
            }
            // Negative numbers look like flags.
            arg if arg.starts_with('-') && arg.parse::<i64>().is_err() => {
                bail!("Unknown option: {arg}\nRun 'signpipe --help' for usage.");
            }
            value => options.batch.push(parse_item(value)?),
        }
    }

    Ok(Command::Sign(options))
}

fn parse_item(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("Not an integer: {value:?}"))
}

/// Parse whitespace-separated integers.
fn parse_batch(input: &str) -> Result<Vec<i64>> {
    input.split_whitespace().map(parse_item).collect()
}

fn load_config(options: &Options) -> Result<PipelineConfig> {
    let mut config = match &options.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };
    if options.instant {
        config.signer = PipelineConfig::instant().signer;
    }
    Ok(config)
}

fn run_sign(options: Options) -> Result<ExitCode> {
    let config = load_config(&options)?;
    tracing::debug!(?config, items = options.batch.len(), "signing");

    let kernel = SigningKernel::new(config);
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt
        .block_on(kernel.sign_batch(&options.batch))
        .context("Signing pipeline failed")?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.joined);
        for failure in &report.failures {
            eprintln!("failed: {failure}");
        }
    }

    if let Some(stats) = kernel.signer_stats() {
        tracing::info!(
            crc32_calls = stats.crc32_calls,
            md5_calls = stats.md5_calls,
            md5_peak = stats.md5_peak_concurrency,
            "signer stats"
        );
    }

    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_help() {
    println!(r#"signpipe v{}

Usage:
  signpipe [OPTIONS] [N ...]     Sign a batch of integers

With no integers on the command line, whitespace-separated integers are
read from stdin. The sorted, '_'-joined signatures are printed on stdout.

Options:
  --config=<path>                Config file (default: ~/.config/signpipe/config.toml)
  --json                         Print the full batch report as JSON
  --instant                      Disable the simulated signer latency
  -h, --help                     Show this help
  -V, --version                  Show version

Exit status is 1 if any item could not be signed.

Examples:
  signpipe 0 1 1 2 3 5 8         # Sign the first Fibonacci numbers
  seq 1 100 | signpipe --instant # Sign a hundred integers quickly
  RUST_LOG=signpipe_kernel=trace signpipe 0
"#, env!("CARGO_PKG_VERSION"));
}
