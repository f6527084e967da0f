use clap::Args;
use snafu::ResultExt;

use crate::{
    error::{PipelineSnafu, Result},
    pipeline_args::PipelineArgs,
};

/// Check the configuration, the storage accounts and the notification endpoint.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[clap(flatten)]
    pipeline: PipelineArgs,
}

impl ValidateArgs {
    pub async fn run(self) -> Result<()> {
        let pipeline = self.pipeline.pipeline()?;
        pipeline.validate().await.context(PipelineSnafu {})?;

        println!("Configuration is valid");
        Ok(())
    }
}
