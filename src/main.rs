use std::process::ExitCode;

use clap::Parser;

use medscan::cli::{self, CliArgs};
use medscan::logger;

fn main() -> ExitCode {
    // Initialize session log (overwrites previous session log)
    logger::init();
    let args = CliArgs::parse();
    cli::run(args)
}
