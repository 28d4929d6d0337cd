use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{ct::CtArgs, error::Result, rekor::RekorArgs};

mod ct;
mod error;
mod proxy;
mod rekor;

#[derive(Parser)]
#[command(name = "tcafe")]
#[command(about = "transparency.cafe log ingesters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a Certificate Transparency log into the store
    Ct {
        #[clap(flatten)]
        inner: CtArgs,
    },
    /// Mirror the Rekor transparency log into the store
    Rekor {
        #[clap(flatten)]
        inner: RekorArgs,
    },
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<()> {
    tcafe_observability::init_observability();

    let cli = Cli::parse();

    let ct = CancellationToken::new();
    spawn_signal_handler(ct.clone());

    match cli.command {
        Commands::Ct { inner } => inner.run(ct).await,
        Commands::Rekor { inner } => inner.run(ct).await,
    }
}

fn spawn_signal_handler(ct: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received interrupt, shutting down");
                ct.cancel();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        ct.cancel();
    });
}
