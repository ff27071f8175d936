use anyhow::Result;
use clap::Parser;

use chat_fabric::{
    cli::{Cli, Command},
    client, operator, peer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Listen(args) => peer::listen(args).await?,
        Command::Connect(args) => peer::connect(args).await?,
        Command::Relay(args) => operator::serve(args).await?,
        Command::Join(args) => client::run(args).await?,
    }

    Ok(())
}
