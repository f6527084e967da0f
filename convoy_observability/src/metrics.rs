use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    error::OTelSdkResult,
    metrics::{
        InstrumentKind, ManualReader, Pipeline, Temporality,
        data::{AggregatedMetrics, Gauge, Metric, MetricData, ResourceMetrics, Sum},
        reader::MetricReader,
    },
};
use snafu::ResultExt;

use crate::{CollectSnafu, ObservabilityError};

/// Keeps the process measurements readable without an OTLP collector.
///
/// Register one clone with the meter provider and keep another to take
/// [`MetricsSnapshot`]s.
#[derive(Clone, Debug)]
pub struct MetricsRecorder {
    reader: Arc<ManualReader>,
}

/// Point-in-time values of every counter and gauge, keyed by series.
///
/// A series is the metric name followed by its sorted attributes, for example
/// `pipeline.blocks.uploaded{schema=requests}`. Histograms are not included.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    series: BTreeMap<String, f64>,
}

impl MetricsRecorder {
    pub fn snapshot(&self) -> Result<MetricsSnapshot, ObservabilityError> {
        let mut rm = ResourceMetrics::default();
        self.reader.collect(&mut rm).context(CollectSnafu {})?;

        let mut snapshot = MetricsSnapshot::default();
        for scope in rm.scope_metrics() {
            for metric in scope.metrics() {
                snapshot.add_metric(metric);
            }
        }

        Ok(snapshot)
    }
}

impl MetricsSnapshot {
    pub fn get(&self, series: &str) -> Option<f64> {
        self.series.get(series).copied()
    }

    /// Sum of all series of the metric `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.series
            .iter()
            .filter(|(series, _)| metric_name(series) == name)
            .map(|(_, value)| value)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.series.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn add_metric(&mut self, metric: &Metric) {
        match metric.data() {
            AggregatedMetrics::U64(MetricData::Sum(sum)) => self.add_sum(metric, sum),
            AggregatedMetrics::I64(MetricData::Sum(sum)) => self.add_sum(metric, sum),
            AggregatedMetrics::F64(MetricData::Sum(sum)) => self.add_sum(metric, sum),
            AggregatedMetrics::U64(MetricData::Gauge(gauge)) => self.add_gauge(metric, gauge),
            AggregatedMetrics::I64(MetricData::Gauge(gauge)) => self.add_gauge(metric, gauge),
            AggregatedMetrics::F64(MetricData::Gauge(gauge)) => self.add_gauge(metric, gauge),
            _ => {}
        }
    }

    fn add_sum<T: DataPointValue>(&mut self, metric: &Metric, sum: &Sum<T>) {
        for dp in sum.data_points() {
            let key = series_key(metric.name(), dp.attributes());
            *self.series.entry(key).or_default() += dp.value().to_f64();
        }
    }

    fn add_gauge<T: DataPointValue>(&mut self, metric: &Metric, gauge: &Gauge<T>) {
        for dp in gauge.data_points() {
            let key = series_key(metric.name(), dp.attributes());
            self.series.insert(key, dp.value().to_f64());
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (series, value)) in self.series.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{series}={value}")?;
        }
        Ok(())
    }
}

fn series_key<'a>(name: &str, attributes: impl Iterator<Item = &'a KeyValue>) -> String {
    let mut labels = attributes
        .map(|kv| format!("{}={}", kv.key.as_str(), kv.value))
        .collect::<Vec<_>>();

    if labels.is_empty() {
        return name.to_string();
    }

    labels.sort();
    format!("{name}{{{}}}", labels.join(","))
}

fn metric_name(series: &str) -> &str {
    series.split_once('{').map_or(series, |(name, _)| name)
}

trait DataPointValue: Copy {
    fn to_f64(&self) -> f64;
}

impl DataPointValue for f64 {
    fn to_f64(&self) -> f64 {
        *self
    }
}

impl DataPointValue for u64 {
    fn to_f64(&self) -> f64 {
        *self as f64
    }
}

impl DataPointValue for i64 {
    fn to_f64(&self) -> f64 {
        *self as f64
    }
}

impl MetricReader for MetricsRecorder {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        self.reader.register_pipeline(pipeline);
    }

    fn collect(&self, rm: &mut ResourceMetrics) -> OTelSdkResult {
        self.reader.collect(rm)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.reader.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.reader.shutdown_with_timeout(timeout)
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.reader.temporality(kind)
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self {
            reader: Arc::new(ManualReader::builder().build()),
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;

    use super::*;

    fn provider(recorder: &MetricsRecorder) -> SdkMeterProvider {
        SdkMeterProvider::builder()
            .with_reader(recorder.clone())
            .build()
    }

    #[test]
    fn test_snapshot_flattens_counter_series() {
        let recorder = MetricsRecorder::default();
        let provider = provider(&recorder);
        let meter = provider.meter("test");

        let uploaded = meter.u64_counter("pipeline.blocks.uploaded").build();
        uploaded.add(3, &[KeyValue::new("schema", "requests")]);
        uploaded.add(2, &[KeyValue::new("schema", "traces")]);
        uploaded.add(1, &[KeyValue::new("schema", "requests")]);

        let snapshot = recorder.snapshot().unwrap();
        assert_eq!(
            snapshot.get("pipeline.blocks.uploaded{schema=requests}"),
            Some(4.0)
        );
        assert_eq!(
            snapshot.get("pipeline.blocks.uploaded{schema=traces}"),
            Some(2.0)
        );
        assert_eq!(snapshot.total("pipeline.blocks.uploaded"), 6.0);
        assert_eq!(snapshot.total("pipeline.blobs.committed"), 0.0);
    }

    #[test]
    fn test_snapshot_reads_gauges_and_up_down_counters() {
        let recorder = MetricsRecorder::default();
        let provider = provider(&recorder);
        let meter = provider.meter("test");

        let in_memory = meter.i64_up_down_counter("pipeline.bytes.in_memory").build();
        in_memory.add(10, &[]);
        in_memory.add(-4, &[]);
        let pipes = meter.u64_gauge("pipeline.upload_pipes").build();
        pipes.record(3, &[]);
        pipes.record(2, &[]);

        let snapshot = recorder.snapshot().unwrap();
        assert_eq!(snapshot.get("pipeline.bytes.in_memory"), Some(6.0));
        assert_eq!(snapshot.get("pipeline.upload_pipes"), Some(2.0));
        assert_eq!(
            snapshot.to_string(),
            "pipeline.bytes.in_memory=6 pipeline.upload_pipes=2"
        );
    }

    #[test]
    fn test_series_key_sorts_attributes() {
        let attributes = [
            KeyValue::new("schema", "requests"),
            KeyValue::new("account", "a1"),
        ];
        assert_eq!(
            series_key("pipeline.blobs.committed", attributes.iter()),
            "pipeline.blobs.committed{account=a1,schema=requests}"
        );
        assert_eq!(
            series_key("pipeline.blobs.committed", std::iter::empty()),
            "pipeline.blobs.committed"
        );
        assert_eq!(
            metric_name("pipeline.blobs.committed{account=a1}"),
            "pipeline.blobs.committed"
        );
    }

    #[test]
    fn test_empty_snapshot_without_measurements() {
        let recorder = MetricsRecorder::default();
        let _provider = provider(&recorder);

        let snapshot = recorder.snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.to_string(), "");
    }
}
