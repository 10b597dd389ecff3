mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::{init_tracing, resolve_host_config};
use crate::cli_args::Cli;
use crate::commands::execute_command;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_host_config(&cli)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute_command(&cli.command, &config, &mut out)
}
