use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use convoy_notify::NotificationService;
use convoy_storage::StorageServiceFactory;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    Event,
    channels::{Channels, spawn_flush},
    cleanup::spawn_storage_cleanup,
    config::PipelineOptions,
    error::{NotificationValidationSnafu, PipelineError, Result, StorageValidationSnafu},
    notification::test_notification,
    recovery::{
        notification::spawn_notification_recovery, side_queue::spawn_side_queues,
        startup::spawn_startup_recovery, storage::spawn_storage_recovery,
    },
    services::{PipelineServices, RecoveryReceivers},
    shutdown::Shutdown,
    state::PipelineState,
    sub_channel::ProducerId,
};

/// The event shipping pipeline.
///
/// Create it with [`Pipeline::new`], call [`Pipeline::start`] once, hand a
/// [`PipelineClient`] to every producer, and drain it with
/// [`Pipeline::shutdown`].
pub struct Pipeline {
    services: Arc<PipelineServices>,
    channels: Arc<Channels>,
    receivers: Option<RecoveryReceivers>,
    next_producer: AtomicU64,
}

/// Appends events on behalf of one producer.
///
/// Events of a client keep their order within a channel.
pub struct PipelineClient {
    producer: ProducerId,
    channels: Arc<Channels>,
}

impl Pipeline {
    pub fn new(
        options: PipelineOptions,
        factory: Arc<dyn StorageServiceFactory>,
        notifier: Arc<dyn NotificationService>,
    ) -> Result<Self> {
        options.validate()?;

        let (services, receivers) =
            PipelineServices::new(options, factory, notifier, CancellationToken::new());
        let channels = Channels::new(services.clone());

        Ok(Self {
            services,
            channels,
            receivers: Some(receivers),
            next_producer: AtomicU64::new(1),
        })
    }

    pub fn services(&self) -> &Arc<PipelineServices> {
        &self.services
    }

    pub fn state(&self) -> &PipelineState {
        &self.services.state
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    pub fn client(&self) -> PipelineClient {
        PipelineClient {
            producer: self.next_producer.fetch_add(1, Ordering::AcqRel),
            channels: self.channels.clone(),
        }
    }

    /// Probe every storage account and the notification endpoint.
    pub async fn validate(&self) -> Result<()> {
        self.validate_storage().await?;
        self.validate_notification().await
    }

    async fn validate_storage(&self) -> Result<()> {
        for account in self.services.accounts.names() {
            self.services
                .accounts
                .test_storage(&account)
                .await
                .context(StorageValidationSnafu {
                    account: account.clone(),
                })?;
            info!(account = %account, "storage account validated");
        }
        Ok(())
    }

    async fn validate_notification(&self) -> Result<()> {
        test_notification(&self.services)
            .await
            .context(NotificationValidationSnafu)?;
        info!("notification endpoint validated");
        Ok(())
    }

    /// Start the background tasks. Does nothing if already started.
    pub async fn start(&mut self) -> Result<()> {
        let Some(receivers) = self.receivers.take() else {
            return Ok(());
        };

        let options = &self.services.options;
        if options.validate_storage {
            self.validate_storage().await?;
        }
        if options.validate_notification {
            self.validate_notification().await?;
        }

        spawn_storage_recovery(&self.services, receivers.storage);
        spawn_notification_recovery(&self.services, receivers.notification);
        spawn_side_queues(&self.services, receivers.side_queue);
        spawn_startup_recovery(&self.services);
        spawn_storage_cleanup(&self.services);
        spawn_flush(&self.channels);

        info!(
            accounts = self.services.accounts.names().len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Wait until the pipeline stops, returning the error that aborted it, if
    /// any.
    pub async fn run(&self) -> Result<()> {
        self.services.root.cancelled().await;
        self.fatal()
    }

    fn fatal(&self) -> Result<()> {
        match self.services.fatal_error() {
            Some(message) => Err(PipelineError::Fatal {
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Drain the pipeline and stop every background task.
    pub async fn shutdown(&self) -> Result<()> {
        Shutdown::new(self.services.clone(), self.channels.clone())
            .submit()
            .await;

        self.services.root.cancel();
        self.services.tasks.close();
        self.services.tasks.wait().await;

        self.fatal()
    }
}

impl PipelineClient {
    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    /// Add an event, waiting while the pipeline holds too many bytes.
    pub async fn append(&self, event: Event) -> Result<()> {
        self.channels.append(self.producer, event).await
    }
}
