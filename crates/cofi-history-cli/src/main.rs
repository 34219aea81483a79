use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cofi_history_cli::Cli::parse();
    cofi_history_cli::init_logging(cli.log_format());
    cofi_history_cli::run_cli(cli)
}
