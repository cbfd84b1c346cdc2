use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use broadcast_relay::{
    cli::{Cli, Command},
    client,
    server::RelayServer,
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
        Command::Server(args) => {
            let addr = args.listen_addr();
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            let server = RelayServer::new(listener, args.relay_config());
            let addr = server.local_addr()?;
            let serving = server.run_until_signal();
            info!("relay listening on {addr}");

            let report = serving.await?;
            info!(
                closed = report.closed_connections,
                aborted = report.aborted_handlers,
                "relay stopped"
            );
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
