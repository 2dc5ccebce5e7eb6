use anyhow::Result;
use clap::Parser;

mod cli;

fn main() -> Result<()> {
    cli::run_cli(cli::Cli::parse())
}
