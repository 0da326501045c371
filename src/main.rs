//! Beacon variant search worker main executable

pub mod common;
pub mod err;
pub mod search;

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Distributed variant search over VCF datasets",
    long_about = "This tool splits variant searches into work units, runs them and merges the results"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum Commands {
    /// Variant search related commands.
    Search(Search),
}

/// Parsing of "search *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Search {
    /// The sub command to run
    #[command(subcommand)]
    command: SearchCommands,
}

/// Enum supporting the parsing of "search *" sub commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum SearchCommands {
    Split(search::cli::SplitArgs),
    Perform(search::cli::PerformArgs),
    Run(search::cli::RunArgs),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector globally, work units log from pool threads.
    tracing::subscriber::set_global_default(collector)?;

    let term = Term::stderr();
    match &cli.command {
        Commands::Search(search) => match &search.command {
            SearchCommands::Split(args) => search::cli::run_split(&cli.common, args)?,
            SearchCommands::Perform(args) => search::cli::run_perform(&cli.common, args)?,
            SearchCommands::Run(args) => search::cli::run_search(&cli.common, args)?,
        },
    }
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
