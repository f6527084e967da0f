use std::{path::PathBuf, sync::Arc};

use clap::Args;
use convoy_notify::HttpNotificationClient;
use convoy_pipeline::{Pipeline, PipelineOptions};
use convoy_storage::{
    LocalFileSystemStorageFactory, StorageServiceFactory, TemporaryFileSystemStorageFactory,
};
use snafu::ResultExt;
use tracing::info;

use crate::error::{PipelineSnafu, Result, StorageSnafu};

/// Arguments shared by the commands that build a pipeline.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Path of the TOML configuration file.
    #[arg(long, short, env = "CONVOY_CONFIG")]
    config: PathBuf,
    /// Directory holding the storage accounts.
    ///
    /// Each account is a subdirectory. A temporary directory is used when
    /// missing.
    #[arg(long, env = "CONVOY_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,
    /// Override the notification endpoint of the configuration file.
    #[arg(long, env = "CONVOY_NOTIFICATION_ENDPOINT")]
    notification_endpoint: Option<String>,
}

impl PipelineArgs {
    pub fn options(&self) -> Result<PipelineOptions> {
        let mut options = PipelineOptions::from_toml_file(&self.config).context(PipelineSnafu {})?;
        if let Some(endpoint) = &self.notification_endpoint {
            options.notification_endpoint = endpoint.clone();
        }
        Ok(options)
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        let options = self.options()?;
        let factory = self.storage_factory()?;
        let notifier = Arc::new(HttpNotificationClient::new(
            options.notification_endpoint.clone(),
        ));

        Pipeline::new(options, factory, notifier).context(PipelineSnafu {})
    }

    fn storage_factory(&self) -> Result<Arc<dyn StorageServiceFactory>> {
        match &self.storage_root {
            Some(root) => {
                let factory = LocalFileSystemStorageFactory::new(root).context(StorageSnafu {
                    path: root.display().to_string(),
                })?;
                info!(root = %factory.root_path().display(), "using local storage");
                Ok(Arc::new(factory))
            }
            None => {
                let factory = TemporaryFileSystemStorageFactory::new().context(StorageSnafu {
                    path: "temporary directory",
                })?;
                info!(root = %factory.root_path().display(), "using temporary storage");
                Ok(Arc::new(factory))
            }
        }
    }
}
