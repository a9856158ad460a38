use clap::Parser;

use synapse_engine::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = cli::run(cli).await {
        eprintln!("Error: {:#}", err.error());
        std::process::exit(err.code());
    }
}
