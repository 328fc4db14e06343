//! Batch Processor - Pure Batching Abstraction
//!
//! Groups finished spans by trace id, collects metric points, and decides
//! when to flush based on size and time thresholds. No `Arc`, no atomics and
//! no stored exporter: concurrency lives in [`pipeline`](crate::pipeline).
//!
//! ```rust,ignore
//! let mut processor = BatchProcessor::new(BatchConfig::default());
//! processor.add(record);
//! if processor.should_flush() {
//!     processor.flush(exporter.as_ref()).await?;
//! }
//! ```
//!
//! | Type | Location | Fields | Use Case |
//! |------|----------|--------|----------|
//! | `BatchMetrics` | `batch_processor.rs` | Plain `u64` | Sequential export |
//! | `ExportMetrics` | `pipeline.rs` | `AtomicU64` | Concurrent export tasks |

use crate::config::OtelConfig;
use crate::exporter::{ExportError, TelemetryExporterBoxed};
use crate::handoff::ExportRecord;
use crate::metrics::{MetricBatch, MetricPoint};
use crate::span::{FinishedSpan, SpanBatch};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch processing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of records (spans plus metric points) per batch
    pub batch_size_limit: usize,
    /// Maximum time to wait before flushing a batch
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: 512,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    pub fn from_config(config: &OtelConfig) -> Self {
        Self {
            batch_size_limit: config.max_batch_size,
            batch_timeout: config.batch_delay(),
        }
    }
}

/// Metrics for batch processing (plain u64 - no atomic overhead for sequential use)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Total spans exported
    pub spans_exported: u64,
    /// Total metric points exported
    pub metric_points_exported: u64,
    /// Total batches exported
    pub batches_exported: u64,
    /// Total export errors
    pub export_errors: u64,
}

impl BatchMetrics {
    /// Record a successful export
    pub fn record_success(&mut self, span_count: u64, point_count: u64) {
        self.spans_exported += span_count;
        self.metric_points_exported += point_count;
        self.batches_exported += 1;
    }

    /// Record an export error
    pub fn record_error(&mut self) {
        self.export_errors += 1;
    }
}

/// Spans and metric points taken from the processor in one go.
#[derive(Debug, Clone, Default)]
pub struct ExportBatch {
    pub spans: SpanBatch,
    pub metrics: MetricBatch,
}

impl ExportBatch {
    pub fn len(&self) -> usize {
        self.spans.len() + self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.metrics.is_empty()
    }

    /// Sends both halves to `exporter`; the first failure wins.
    pub async fn export(self, exporter: &dyn TelemetryExporterBoxed) -> Result<(), ExportError> {
        let spans = if self.spans.is_empty() {
            Ok(())
        } else {
            exporter.export_spans_boxed(self.spans).await
        };
        let metrics = if self.metrics.is_empty() {
            Ok(())
        } else {
            exporter.export_metrics_boxed(self.metrics).await
        };
        spans.and(metrics)
    }
}

/// Batch processor that groups spans by trace_id and decides when to flush.
///
/// This is a pure batching abstraction with no concurrency concerns.
/// For concurrent exports, use `take_batch()` and manage export tasks externally.
pub struct BatchProcessor {
    /// Pending spans grouped by trace_id
    pending_spans: HashMap<u128, Vec<FinishedSpan>>,
    pending_points: Vec<MetricPoint>,
    config: BatchConfig,
    metrics: BatchMetrics,
    last_flush: Instant,
}

impl BatchProcessor {
    /// Creates a new batch processor
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending_spans: HashMap::new(),
            pending_points: Vec::new(),
            config,
            metrics: BatchMetrics::default(),
            last_flush: Instant::now(),
        }
    }

    /// Adds one handed-off record to the batch
    pub fn add(&mut self, record: ExportRecord) {
        match record {
            ExportRecord::Span(span) => self.add_span(span),
            ExportRecord::Metric(point) => self.pending_points.push(point),
        }
    }

    pub fn add_span(&mut self, span: FinishedSpan) {
        self.pending_spans.entry(span.trace_id).or_default().push(span);
    }

    /// Returns the total number of pending spans
    pub fn pending_spans(&self) -> usize {
        self.pending_spans.values().map(Vec::len).sum()
    }

    pub fn pending_points(&self) -> usize {
        self.pending_points.len()
    }

    /// Returns the total number of pending records
    pub fn total_pending(&self) -> usize {
        self.pending_spans() + self.pending_points()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_spans.is_empty() && self.pending_points.is_empty()
    }

    /// Checks if the batch should be flushed
    pub fn should_flush(&self) -> bool {
        !self.is_empty()
            && (self.total_pending() >= self.config.batch_size_limit
                || self.last_flush.elapsed() >= self.config.batch_timeout)
    }

    /// Flushes everything pending through `exporter` (sequential - blocks until export completes)
    pub async fn flush(&mut self, exporter: &dyn TelemetryExporterBoxed) -> Result<(), ExportError> {
        let Some(batch) = self.take_batch() else {
            return Ok(());
        };
        let span_count = batch.spans.len() as u64;
        let point_count = batch.metrics.len() as u64;

        match batch.export(exporter).await {
            Ok(()) => {
                self.metrics.record_success(span_count, point_count);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    /// Takes all pending records as a batch (for concurrent export)
    ///
    /// Returns `None` if nothing is pending. Spans of one trace stay
    /// adjacent in the returned batch.
    pub fn take_batch(&mut self) -> Option<ExportBatch> {
        if self.is_empty() {
            return None;
        }

        let spans: Vec<FinishedSpan> = self
            .pending_spans
            .drain()
            .flat_map(|(_, spans)| spans)
            .collect();
        let points = std::mem::take(&mut self.pending_points);

        self.last_flush = Instant::now();
        Some(ExportBatch {
            spans: SpanBatch::with_spans(spans),
            metrics: MetricBatch::with_points(points),
        })
    }

    /// Returns current metrics (for sequential use)
    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }

    /// Returns mutable metrics (for recording from external flush)
    pub fn metrics_mut(&mut self) -> &mut BatchMetrics {
        &mut self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TraceContext;
    use crate::exporter::{NullExporter, TestExporter};
    use crate::metrics::MetricKind;
    use crate::span::{Attributes, Span, SpanKind, SpanStatus};

    fn span_in(trace: &TraceContext, name: &str) -> FinishedSpan {
        Span::child_of(trace, name, SpanKind::Internal).end(SpanStatus::Ok, None)
    }

    fn point(name: &str) -> MetricPoint {
        MetricPoint {
            name: name.to_string(),
            kind: MetricKind::Counter,
            value: 1.0,
            unit: "1".to_string(),
            attributes: Attributes::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_batch_processor_basic() {
        let exporter = NullExporter::new();
        let config = BatchConfig {
            batch_size_limit: 5,
            batch_timeout: Duration::from_secs(10),
        };
        let mut processor = BatchProcessor::new(config);
        let trace = TraceContext::new_root(true);

        for i in 0..3 {
            processor.add(ExportRecord::Span(span_in(&trace, &format!("op-{i}"))));
        }
        assert_eq!(processor.total_pending(), 3);
        assert!(!processor.should_flush());

        processor.add(ExportRecord::Span(span_in(&trace, "op-3")));
        processor.add(ExportRecord::Metric(point("m")));
        assert!(processor.should_flush());

        processor.flush(&exporter).await.unwrap();
        assert_eq!(processor.total_pending(), 0);
        assert_eq!(processor.metrics().spans_exported, 4);
        assert_eq!(processor.metrics().metric_points_exported, 1);
        assert_eq!(processor.metrics().batches_exported, 1);
    }

    #[tokio::test]
    async fn test_spans_of_one_trace_stay_together() {
        let exporter = TestExporter::new();
        let mut processor = BatchProcessor::new(BatchConfig::default());
        let traces: Vec<_> = (0..3).map(|_| TraceContext::new_root(true)).collect();

        for round in 0..2 {
            for trace in &traces {
                processor.add_span(span_in(trace, &format!("r{round}")));
            }
        }
        assert_eq!(processor.pending_spans(), 6);
        processor.flush(&exporter).await.unwrap();

        let spans = exporter.spans();
        assert_eq!(spans.len(), 6);
        for pair in spans.chunks(2) {
            assert_eq!(pair[0].trace_id, pair[1].trace_id);
        }
    }

    #[tokio::test]
    async fn test_timeout_triggers_flush() {
        let mut processor = BatchProcessor::new(BatchConfig {
            batch_size_limit: 1000,
            batch_timeout: Duration::ZERO,
        });
        assert!(!processor.should_flush());
        processor.add(ExportRecord::Metric(point("m")));
        assert!(processor.should_flush());
    }

    #[test]
    fn test_take_batch() {
        let mut processor = BatchProcessor::new(BatchConfig::default());
        assert!(processor.take_batch().is_none());

        let trace = TraceContext::new_root(true);
        for i in 0..5 {
            processor.add_span(span_in(&trace, &format!("op-{i}")));
        }
        processor.add(ExportRecord::Metric(point("m")));

        let batch = processor.take_batch().unwrap();
        assert_eq!(batch.spans.len(), 5);
        assert_eq!(batch.metrics.len(), 1);
        assert_eq!(batch.len(), 6);
        assert!(processor.is_empty());
        assert!(processor.take_batch().is_none());
    }
}
