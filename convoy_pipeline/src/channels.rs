//! Routing of events to channels, and the periodic flush of all channels.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    Event,
    channel::{Channel, ChannelKey},
    error::{PipelineError, Result},
    flow_control::FlowControl,
    services::PipelineServices,
    sub_channel::ProducerId,
};

pub const METADATA_FIELD: &str = "@metadata";
pub const SCHEMA_ID_FIELD: &str = "schema_id";
pub const INSTRUMENTATION_KEY_FIELD: &str = "instrumentation_key";

pub struct Channels {
    services: Arc<PipelineServices>,
    channels: DashMap<ChannelKey, Arc<Channel>>,
    flow_control: FlowControl,
    closing: AtomicBool,
    /// Held shared by appends in progress; `close` takes it exclusively.
    gate: RwLock<()>,
}

impl Channels {
    pub fn new(services: Arc<PipelineServices>) -> Arc<Self> {
        let options = &services.options;
        let flow_control = FlowControl::new(
            services.state.clone(),
            options.flow_control_suspend_bytes.as_u64(),
            options.flow_control_resume_bytes.as_u64(),
            options.flow_control_delay,
        );

        Arc::new(Self {
            services,
            channels: DashMap::new(),
            flow_control,
            closing: AtomicBool::new(false),
            gate: RwLock::new(()),
        })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Find the channel key of the event and strip its metadata.
    pub fn route(&self, event: &mut Event) -> Option<ChannelKey> {
        let metadata = event.remove(METADATA_FIELD);
        let field = |name: &str| -> Option<String> {
            metadata
                .as_ref()
                .and_then(|metadata| metadata.get(name))
                .or_else(|| event.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let options = &self.services.options;
        let schema_id = field(SCHEMA_ID_FIELD).unwrap_or_else(|| options.default_schema_id().to_string());
        let instrumentation_key = field(INSTRUMENTATION_KEY_FIELD)
            .or_else(|| options.schema_instrumentation_key(&schema_id).map(str::to_string))?;

        Some(ChannelKey::new(instrumentation_key, schema_id))
    }

    /// Add an event, waiting while too many bytes are in memory.
    pub async fn append(&self, producer: ProducerId, mut event: Event) -> Result<()> {
        if self.is_closing() {
            return Err(PipelineError::ShuttingDown);
        }

        let Some(key) = self.route(&mut event) else {
            warn!("event has no instrumentation key, dropping it");
            self.services.metrics.events_dropped.add(1, &[]);
            return Ok(());
        };

        self.flow_control.pass_or_wait().await;

        let _gate = self.gate.read().await;
        if self.is_closing() {
            return Err(PipelineError::ShuttingDown);
        }
        self.channel(&key).append(producer, &event);

        Ok(())
    }

    /// The channel of the key, created on first use.
    pub fn channel(&self, key: &ChannelKey) -> Arc<Channel> {
        if let Some(channel) = self.channels.get(key) {
            return channel.clone();
        }

        self.channels
            .entry(key.clone())
            .or_insert_with(|| {
                let options = self
                    .services
                    .options
                    .channel_options(&key.instrumentation_key, &key.schema_id);
                Channel::new(self.services.clone(), options)
            })
            .clone()
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|channel| channel.clone())
    }

    fn all(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn flush_all(&self) {
        for channel in self.all() {
            channel.flush();
        }
    }

    /// Stop taking events and flush what was taken.
    ///
    /// Returns once every append already past the closing check is done.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        drop(self.gate.write().await);
        self.flush_all();
        info!(channels = self.channels.len(), "channels closed");
    }

    pub fn close_pipes(&self) {
        for channel in self.all() {
            channel.close_pipes();
        }
    }
}

pub(crate) fn spawn_flush(channels: &Arc<Channels>) {
    let services = channels.services.clone();
    services.tasks.spawn(run_flush(channels.clone()));
}

async fn run_flush(channels: Arc<Channels>) {
    let services = channels.services.clone();
    let mut interval = tokio::time::interval(services.options.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = services.root.cancelled() => return,
            _ = interval.tick() => {}
        }

        if channels.is_closing() {
            return;
        }
        channels.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        config::{PipelineOptions, SchemaOptions},
        test_utils::{RecordingNotifier, services_with},
    };
    use convoy_storage::InMemoryStorageFactory;

    fn channels(options: PipelineOptions) -> Arc<Channels> {
        let services = services_with(
            options.with_account("account1", &["key1"]),
            Arc::new(InMemoryStorageFactory::new()),
            Arc::new(RecordingNotifier::default()),
        );
        Channels::new(services)
    }

    fn event(value: Value) -> Event {
        match value {
            Value::Object(object) => object,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_route_prefers_metadata() {
        let channels = channels(PipelineOptions::default().with_instrumentation_key("default-ikey"));

        let mut e = event(json!({
            "@metadata": {"schema_id": "meta-schema", "instrumentation_key": "meta-ikey"},
            "schema_id": "field-schema",
            "instrumentation_key": "field-ikey",
        }));
        assert_eq!(channels.route(&mut e), Some(ChannelKey::new("meta-ikey", "meta-schema")));
        assert!(!e.contains_key(METADATA_FIELD));

        let mut e = event(json!({"schema_id": "field-schema", "instrumentation_key": "field-ikey"}));
        assert_eq!(channels.route(&mut e), Some(ChannelKey::new("field-ikey", "field-schema")));

        let mut e = event(json!({"message": "hello"}));
        assert_eq!(channels.route(&mut e), Some(ChannelKey::new("default-ikey", "default")));
    }

    #[tokio::test]
    async fn test_route_uses_schema_key() {
        let schema = SchemaOptions {
            instrumentation_key: Some("schema-ikey".to_string()),
            ..Default::default()
        };
        let channels = channels(PipelineOptions::default().with_schema("requests", schema));

        let mut e = event(json!({"schema_id": "requests"}));
        assert_eq!(channels.route(&mut e), Some(ChannelKey::new("schema-ikey", "requests")));

        let mut e = event(json!({"schema_id": "other"}));
        assert_eq!(channels.route(&mut e), None);
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let channels = channels(PipelineOptions::default().with_instrumentation_key("ikey"));
        channels.append(1, event(json!({"a": 1}))).await.unwrap();
        assert!(channels.get(&ChannelKey::new("ikey", "default")).is_some());

        channels.close().await;
        assert!(matches!(
            channels.append(1, event(json!({"a": 2}))).await,
            Err(PipelineError::ShuttingDown)
        ));
    }
}
