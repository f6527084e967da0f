use convoy_observability::ObservabilityError;
use convoy_pipeline::PipelineError;
use convoy_storage::StorageError;
use snafu::Snafu;

/// CLI error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("Failed to initialize observability"))]
    Observability { source: ObservabilityError },
    #[snafu(display("Pipeline error"))]
    Pipeline { source: PipelineError },
    #[snafu(display("Failed to open storage at {path}"))]
    Storage { path: String, source: StorageError },
    #[snafu(display("Failed to read {input}"))]
    Input {
        input: String,
        source: std::io::Error,
    },
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
