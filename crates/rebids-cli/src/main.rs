//! ReBIDS CLI
//!
//! Command-line workflows for reorganizing source neuroimaging data
//! into a BIDS dataset

mod commands;
mod output;

use clap::{Parser, Subcommand};
use rebids_core::{Result, init_tracing};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "rebids")]
#[command(about = "Reorganize source neuroimaging data into a BIDS dataset")]
#[command(version = rebids_core::VERSION)]
#[command(
    long_about = "rebids drives a dataset through the standard stages:\n\
\n\
Examples:\n  \
rebids prepare raw/ prepared/             # Normalize the source layout\n  \
rebids map prepared/ bids/ --template map.yaml\n  \
rebids bidsify prepared/ bids/            # Build the BIDS tree\n  \
rebids process prepared/ bids/bidsmap.yaml  # Dry validation pass"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (can be used multiple times for increased verbosity)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize an arbitrary source layout into the prepared
    /// sub-*/ses-*/module/series layout
    Prepare {
        /// Source dataset root, one directory per subject
        source: PathBuf,

        /// Destination root for the prepared layout
        destination: PathBuf,

        /// Module the prepared recordings belong to
        #[arg(long, default_value = "MRI")]
        module: String,

        /// Only process the listed subjects
        #[arg(long)]
        subjects: Vec<String>,

        /// Skip series already present in the destination
        #[arg(long)]
        skip_existing: bool,
    },

    /// Match prepared recordings against the map and grow it: matched
    /// template runs are frozen in, unmatched recordings banked for review
    #[command(alias = "mapper")]
    Map {
        /// Prepared dataset root
        source: PathBuf,

        /// BIDS destination root; the working map lives here by default
        destination: PathBuf,

        /// Working bidsmap path (default: <destination>/bidsmap.yaml)
        #[arg(long)]
        bidsmap: Option<PathBuf>,

        /// Template bidsmap consulted for recordings the working map misses
        #[arg(long)]
        template: Option<PathBuf>,

        /// Only process the listed subjects
        #[arg(long)]
        subjects: Vec<String>,
    },

    /// Reorganize prepared recordings into the BIDS dataset
    Bidsify {
        /// Prepared dataset root
        source: PathBuf,

        /// BIDS destination root
        destination: PathBuf,

        /// Bidsmap path (default: <destination>/bidsmap.yaml)
        #[arg(long)]
        bidsmap: Option<PathBuf>,

        /// Participants sidecar declaring the table columns
        #[arg(long)]
        participants: Option<PathBuf>,

        /// Only process the listed subjects
        #[arg(long)]
        subjects: Vec<String>,

        /// Keep conflicting participant rows instead of failing
        #[arg(long)]
        allow_conflicts: bool,

        /// Fail on ambiguous matches instead of keeping the first
        #[arg(long)]
        strict: bool,

        /// Skip output files that already exist
        #[arg(long)]
        skip_existing: bool,
    },

    /// Dry validation pass: match and resolve names without writing
    Process {
        /// Prepared dataset root
        source: PathBuf,

        /// Bidsmap path
        bidsmap: PathBuf,

        /// Only process the listed subjects
        #[arg(long)]
        subjects: Vec<String>,

        /// Fail on ambiguous matches instead of keeping the first
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let log_level = match cli.verbose {
        0 => "rebids=warn",
        1 => "rebids=info",
        2 => "rebids=debug",
        _ => "rebids=trace",
    };
    unsafe {
        std::env::set_var("RUST_LOG", log_level);
    }
    init_tracing();

    if let Err(e) = run_command(cli) {
        error!("{e}");
        std::process::exit(e.kind().exit_code());
    }
}

fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Prepare {
            source,
            destination,
            module,
            subjects,
            skip_existing,
        } => commands::prepare::prepare_command(&commands::prepare::PrepareArgs {
            source,
            destination,
            module,
            subjects,
            skip_existing,
        }),
        Commands::Map {
            source,
            destination,
            bidsmap,
            template,
            subjects,
        } => commands::map::map_command(&commands::map::MapArgs {
            source,
            destination,
            bidsmap,
            template,
            subjects,
        }),
        Commands::Bidsify {
            source,
            destination,
            bidsmap,
            participants,
            subjects,
            allow_conflicts,
            strict,
            skip_existing,
        } => commands::bidsify::bidsify_command(&commands::bidsify::BidsifyArgs {
            source,
            destination,
            bidsmap,
            participants,
            subjects,
            allow_conflicts,
            strict,
            skip_existing,
        }),
        Commands::Process {
            source,
            bidsmap,
            subjects,
            strict,
        } => commands::process::process_command(&commands::process::ProcessArgs {
            source,
            bidsmap,
            subjects,
            strict,
        }),
    }
}
