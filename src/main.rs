use clap::Parser;
use kubedox::cli::{commands, Cli};
use std::process;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(cli.log_filter())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting kubedox v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(command) => commands::handle_command(command, cli.config).await?,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    }

    Ok(())
}
