//! Genesis CLI: queue-driven blockchain testnet orchestration.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "genesis",
    version,
    about = "Queue-driven orchestration engine for multi-node blockchain test networks"
)]
struct Cli {
    #[command(subcommand)]
    command: genesis::cli::Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = genesis::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
