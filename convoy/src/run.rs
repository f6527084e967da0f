use std::{path::PathBuf, time::Duration};

use clap::Args;
use convoy_observability::MetricsRecorder;
use convoy_pipeline::{Event, PipelineClient};
use snafu::ResultExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    time::{Instant, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{InputSnafu, PipelineSnafu, Result},
    pipeline_args::PipelineArgs,
};

/// Ship newline-delimited JSON events until the input ends.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[clap(flatten)]
    pipeline: PipelineArgs,
    /// Read events from this file instead of stdin.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Seconds between two pipeline metrics reports in the log.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    metrics_interval: u64,
}

impl RunArgs {
    pub async fn run(self, ct: CancellationToken, recorder: MetricsRecorder) -> Result<()> {
        let mut pipeline = self.pipeline.pipeline()?;
        pipeline.start().await.context(PipelineSnafu {})?;

        let client = pipeline.client();
        let forward = async {
            match &self.input {
                Some(path) => {
                    let name = path.display().to_string();
                    let file = tokio::fs::File::open(path)
                        .await
                        .context(InputSnafu { input: name.clone() })?;
                    forward_events(&client, file, &name).await
                }
                None => forward_events(&client, tokio::io::stdin(), "stdin").await,
            }
        };

        tokio::select! {
            result = forward => {
                let count = result?;
                info!(events = count, "input exhausted");
            }
            _ = ct.cancelled() => {
                info!("interrupted");
            }
            result = pipeline.run() => {
                log_metrics(&recorder);
                return result.context(PipelineSnafu {});
            }
            _ = report_metrics(&recorder, Duration::from_secs(self.metrics_interval)) => {}
        }

        let result = pipeline.shutdown().await.context(PipelineSnafu {});
        log_metrics(&recorder);
        result
    }
}

async fn report_metrics(recorder: &MetricsRecorder, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        log_metrics(recorder);
    }
}

fn log_metrics(recorder: &MetricsRecorder) {
    let snapshot = match recorder.snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(err = %err, "failed to collect pipeline metrics");
            return;
        }
    };

    info!(
        received = snapshot.total("pipeline.events.received"),
        dropped = snapshot.total("pipeline.events.dropped"),
        blocks = snapshot.total("pipeline.blocks.uploaded"),
        bytes = snapshot.total("pipeline.blocks.uploaded.size"),
        committed = snapshot.total("pipeline.blobs.committed"),
        notified = snapshot.total("pipeline.blobs.notified"),
        "pipeline metrics"
    );
    debug!(series = %snapshot, "pipeline metric series");
}

async fn forward_events(
    client: &PipelineClient,
    input: impl AsyncRead + Unpin,
    name: &str,
) -> Result<u64> {
    let mut lines = BufReader::new(input).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await.context(InputSnafu { input: name })? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                client.append(event).await.context(PipelineSnafu {})?;
                count += 1;
            }
            Err(err) => warn!(err = %err, "skipping line that is not a JSON object"),
        }
    }

    Ok(count)
}
