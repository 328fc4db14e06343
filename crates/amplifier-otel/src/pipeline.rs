//! Background export pipeline.
//!
//! Bridges the synchronous [`ExportHandle`] used by the span engine with an
//! async exporter. A single consumer task drains the handoff queue into a
//! [`BatchProcessor`] and spawns bounded concurrent exports. Export failures
//! are logged and counted, never retried.

use crate::batch_processor::{BatchConfig, BatchProcessor, ExportBatch};
use crate::config::OtelConfig;
use crate::exporter::{ExportError, TelemetryExporterBoxed};
use crate::handoff::{self, ExportHandle, ExportReceiver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

/// Error types for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Error during export
    #[error("export failed: {0}")]
    ExportFailed(#[from] ExportError),
    /// The consumer task panicked or was cancelled
    #[error("export task join error: {0}")]
    Join(String),
}

/// Thread-safe metrics for concurrent exports (uses atomics)
///
/// Separate from `BatchMetrics`, which uses plain u64 for sequential use.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    spans_exported: AtomicU64,
    metric_points_exported: AtomicU64,
    batches_exported: AtomicU64,
    export_errors: AtomicU64,
    inflight_exports: AtomicU64,
}

impl ExportMetrics {
    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn metric_points_exported(&self) -> u64 {
        self.metric_points_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    fn record_success(&self, span_count: u64, point_count: u64) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.metric_points_exported
            .fetch_add(point_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_inflight(&self) {
        self.inflight_exports.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_inflight(&self) {
        self.inflight_exports.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Configuration for the export pipeline
#[derive(Debug, Clone)]
pub struct ExportPipelineConfig {
    /// Capacity of the handoff queue; submissions beyond it are dropped
    pub queue_capacity: usize,
    pub batch_config: BatchConfig,
    /// How often the consumer checks the flush thresholds
    pub flush_check_interval: Duration,
    /// Maximum concurrent export operations
    pub max_concurrent_exports: usize,
}

impl Default for ExportPipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            batch_config: BatchConfig::default(),
            flush_check_interval: Duration::from_millis(100),
            max_concurrent_exports: 4,
        }
    }
}

impl ExportPipelineConfig {
    pub fn from_config(config: &OtelConfig) -> Self {
        Self {
            queue_capacity: config.max_queue_size,
            batch_config: BatchConfig::from_config(config),
            ..Self::default()
        }
    }

    pub fn with_flush_check_interval(mut self, interval: Duration) -> Self {
        self.flush_check_interval = interval;
        self
    }
}

/// Helper function to export a batch and record metrics (for concurrent tasks)
async fn export_batch(
    exporter: Arc<dyn TelemetryExporterBoxed>,
    batch: ExportBatch,
    metrics: &ExportMetrics,
) -> Result<(), ExportError> {
    let span_count = batch.spans.len() as u64;
    let point_count = batch.metrics.len() as u64;
    match batch.export(exporter.as_ref()).await {
        Ok(()) => {
            metrics.record_success(span_count, point_count);
            Ok(())
        }
        Err(e) => {
            metrics.record_error();
            Err(e)
        }
    }
}

/// Owns the consumer task that batches and exports handed-off records.
pub struct ExportPipeline {
    handle: ExportHandle,
    consumer_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    export_metrics: Arc<ExportMetrics>,
    exporter_name: String,
}

impl ExportPipeline {
    /// Creates the handoff queue and spawns the consumer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ExportPipelineConfig, exporter: Arc<dyn TelemetryExporterBoxed>) -> Self {
        let (handle, receiver) = handoff::channel(config.queue_capacity);
        let export_metrics = Arc::new(ExportMetrics::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let exporter_name = exporter.name().to_string();

        let consumer_task = tokio::spawn(run_consumer(
            config,
            exporter,
            receiver,
            Arc::clone(&export_metrics),
            shutdown_rx,
        ));
        debug!(exporter = %exporter_name, "export pipeline started");

        Self {
            handle,
            consumer_task: Some(consumer_task),
            shutdown_tx: Some(shutdown_tx),
            export_metrics,
            exporter_name,
        }
    }

    /// Submission side for the span engine.
    pub fn handle(&self) -> ExportHandle {
        self.handle.clone()
    }

    /// Returns export metrics (thread-safe for concurrent exports)
    pub fn export_metrics(&self) -> &Arc<ExportMetrics> {
        &self.export_metrics
    }

    pub fn exporter_name(&self) -> &str {
        &self.exporter_name
    }

    /// Drains the queue, flushes what is pending and waits for in-flight
    /// exports.
    pub async fn shutdown(mut self) -> Result<(), PipelineError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.consumer_task.take() {
            task.await.map_err(|e| PipelineError::Join(e.to_string()))?;
        }

        debug!(
            exporter = %self.exporter_name,
            spans = self.export_metrics.spans_exported(),
            metric_points = self.export_metrics.metric_points_exported(),
            errors = self.export_metrics.export_errors(),
            "export pipeline stopped"
        );
        Ok(())
    }
}

async fn run_consumer(
    config: ExportPipelineConfig,
    exporter: Arc<dyn TelemetryExporterBoxed>,
    mut receiver: ExportReceiver,
    metrics: Arc<ExportMetrics>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(config.flush_check_interval);
    let mut batch_processor = BatchProcessor::new(config.batch_config);
    let export_semaphore = Arc::new(Semaphore::new(config.max_concurrent_exports.max(1)));
    let mut export_tasks: JoinSet<Result<(), ExportError>> = JoinSet::new();

    loop {
        tokio::select! {
            Some(result) = export_tasks.join_next(), if !export_tasks.is_empty() => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "telemetry export failed"),
                    Err(e) => error!(error = %e, "telemetry export task panicked"),
                }
            }

            record = receiver.recv() => {
                match record {
                    Some(record) => batch_processor.add(record),
                    // Every handle dropped; treat like shutdown.
                    None => break,
                }
            }

            _ = interval.tick() => {
                if batch_processor.should_flush() {
                    if let Some(batch) = batch_processor.take_batch() {
                        let Ok(permit) = Arc::clone(&export_semaphore).acquire_owned().await else {
                            break;
                        };
                        let exporter = Arc::clone(&exporter);
                        let metrics = Arc::clone(&metrics);
                        metrics.inc_inflight();

                        export_tasks.spawn(async move {
                            let result = export_batch(exporter, batch, &metrics).await;
                            metrics.dec_inflight();
                            drop(permit);
                            result
                        });
                    }
                }
            }

            _ = &mut shutdown_rx => break,
        }
    }

    // Drain whatever was handed off before shutdown.
    for record in receiver.drain() {
        batch_processor.add(record);
    }

    if let Some(batch) = batch_processor.take_batch() {
        if let Err(e) = export_batch(Arc::clone(&exporter), batch, &metrics).await {
            error!(error = %e, "final telemetry export failed");
        }
    }

    while let Some(result) = export_tasks.join_next().await {
        if let Ok(Err(e)) = result {
            error!(error = %e, "in-flight telemetry export failed during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TraceContext;
    use crate::exporter::{TelemetryExporter, TestExporter};
    use crate::metrics::MetricBatch;
    use crate::span::{Span, SpanBatch, SpanKind, SpanStatus};
    use parking_lot::Mutex;
    use std::io::Write;

    struct FailingExporter;

    impl TelemetryExporter for FailingExporter {
        async fn export_spans(&self, _batch: SpanBatch) -> Result<(), ExportError> {
            Err(ExportError::Transport("collector unreachable".to_string()))
        }

        async fn export_metrics(&self, _batch: MetricBatch) -> Result<(), ExportError> {
            Err(ExportError::Transport("collector unreachable".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn finished(trace: &TraceContext, i: usize) -> crate::span::FinishedSpan {
        Span::child_of(trace, format!("op-{i}"), SpanKind::Internal).end(SpanStatus::Ok, None)
    }

    #[tokio::test]
    async fn test_pipeline_exports_on_interval() {
        let exporter = Arc::new(TestExporter::new());
        let config = ExportPipelineConfig {
            batch_config: BatchConfig {
                batch_size_limit: 5,
                batch_timeout: Duration::from_secs(60),
            },
            ..Default::default()
        }
        .with_flush_check_interval(Duration::from_millis(20));
        let pipeline = ExportPipeline::spawn(config, exporter.clone());

        let handle = pipeline.handle();
        let trace = TraceContext::new_root(true);
        for i in 0..10 {
            handle.submit_span(finished(&trace, i)).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exporter.exported_count(), 10);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains() {
        let exporter = Arc::new(TestExporter::new());
        let pipeline = ExportPipeline::spawn(ExportPipelineConfig::default(), exporter.clone());

        let handle = pipeline.handle();
        let trace = TraceContext::new_root(true);
        for i in 0..100 {
            handle.submit_span(finished(&trace, i)).unwrap();
        }

        let metrics = Arc::clone(pipeline.export_metrics());
        pipeline.shutdown().await.unwrap();
        assert_eq!(exporter.exported_count(), 100);
        assert_eq!(metrics.spans_exported(), 100);
        assert_eq!(metrics.inflight_exports(), 0);
    }

    #[tokio::test]
    async fn test_slow_exporter_never_blocks_submission() {
        let exporter = Arc::new(TestExporter::slow(Duration::from_millis(100)));
        let config = ExportPipelineConfig {
            queue_capacity: 4,
            ..Default::default()
        };
        let pipeline = ExportPipeline::spawn(config, exporter.clone());
        let handle = pipeline.handle();
        let trace = TraceContext::new_root(true);

        let started = std::time::Instant::now();
        for i in 0..1000 {
            let _ = handle.submit_span(finished(&trace, i));
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        let submitted = handle.metrics().spans_submitted();
        assert_eq!(submitted + handle.metrics().spans_dropped(), 1000);

        pipeline.shutdown().await.unwrap();
        assert_eq!(exporter.exported_count() as u64, submitted);
    }

    #[tokio::test]
    async fn test_export_failures_logged_at_error() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = ExportPipelineConfig {
            batch_config: BatchConfig {
                batch_size_limit: 1,
                batch_timeout: Duration::from_secs(60),
            },
            ..Default::default()
        }
        .with_flush_check_interval(Duration::from_millis(10));
        let pipeline = ExportPipeline::spawn(config, Arc::new(FailingExporter));

        let trace = TraceContext::new_root(true);
        pipeline.handle().submit_span(finished(&trace, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let metrics = Arc::clone(pipeline.export_metrics());
        pipeline.shutdown().await.unwrap();

        assert_eq!(metrics.export_errors(), 1);
        let logs = logs.contents();
        let line = logs
            .lines()
            .find(|line| line.contains("telemetry export failed"))
            .unwrap_or_else(|| panic!("no export failure logged: {logs}"));
        assert!(line.contains("ERROR"), "{line}");
        assert!(line.contains("collector unreachable"), "{line}");
    }
}
