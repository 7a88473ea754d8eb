//! mergeproc-worker - perform one serialized merge job in its own process

use clap::Parser;
use std::path::PathBuf;

use mergeproc::logging;
use mergeproc::merge::{worker, CopyMerge};

#[derive(Parser)]
#[command(name = "mergeproc-worker")]
#[command(version, about = "Merge one file tree into another from a serialized job", long_about = None)]
struct Cli {
    /// JSON merge job written by the parent scheduler
    #[arg(long, value_name = "PATH")]
    job: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    std::process::exit(worker::run(&cli.job, &CopyMerge));
}
