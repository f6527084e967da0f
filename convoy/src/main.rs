use clap::{Parser, Subcommand};
use convoy_observability::{MetricsRecorder, init_observability};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ObservabilitySnafu, Result},
    run::RunArgs,
    validate::ValidateArgs,
};

mod error;
mod pipeline_args;
mod run;
mod validate;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Ships events to blob storage and notifies the ingestion endpoint")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read events from stdin and ship them
    Run {
        #[clap(flatten)]
        inner: RunArgs,
    },
    /// Check the configuration and probe storage and notification
    Validate {
        #[clap(flatten)]
        inner: ValidateArgs,
    },
}

#[tokio::main]
#[snafu::report]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let recorder = MetricsRecorder::default();
    let telemetry = init_observability(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        recorder.clone(),
    )
    .context(ObservabilitySnafu {})?;

    let ct = CancellationToken::new();

    tokio::spawn({
        let ct = ct.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            ct.cancel();
        }
    });

    let result = match cli.command {
        Commands::Run { inner } => inner.run(ct, recorder).await,
        Commands::Validate { inner } => inner.run().await,
    };

    telemetry.shutdown();
    result
}
