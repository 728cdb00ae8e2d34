use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = score_relay_cli::Cli::parse();
    score_relay_cli::run_cli(cli)
}
