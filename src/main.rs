mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    match cli.command {
        Commands::Version => println!("healer {}", env!("CARGO_PKG_VERSION")),
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => commands::list::run(resource).await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Bundle { name } => commands::bundle::run(name)?,
        Commands::Operator { metrics_addr } => commands::operator::run(metrics_addr, cli.config).await?,
    }

    Ok(())
}
