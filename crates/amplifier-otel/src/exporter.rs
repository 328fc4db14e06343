use crate::metrics::{MetricBatch, MetricPoint};
use crate::span::{FinishedSpan, SpanBatch};
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Error types for telemetry export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, gRPC, HTTP, file I/O)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// Exporter could not be built from its configuration
    #[error("invalid exporter configuration: {0}")]
    InvalidConfig(String),
}

type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

/// Trait for exporting finished spans and metric points to a backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`. For dynamic
/// dispatch use [`TelemetryExporterBoxed`].
pub trait TelemetryExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export_spans(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Exports a batch of metric points.
    fn export_metrics(
        &self,
        batch: MetricBatch,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`TelemetryExporter`] for dynamic dispatch.
pub trait TelemetryExporterBoxed: Send + Sync {
    fn export_spans_boxed(&self, batch: SpanBatch) -> ExportFuture<'_>;

    fn export_metrics_boxed(&self, batch: MetricBatch) -> ExportFuture<'_>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any TelemetryExporter can be used as TelemetryExporterBoxed
impl<T: TelemetryExporter> TelemetryExporterBoxed for T {
    fn export_spans_boxed(&self, batch: SpanBatch) -> ExportFuture<'_> {
        Box::pin(self.export_spans(batch))
    }

    fn export_metrics_boxed(&self, batch: MetricBatch) -> ExportFuture<'_> {
        Box::pin(self.export_metrics(batch))
    }

    fn name(&self) -> &str {
        TelemetryExporter::name(self)
    }
}

/// Console exporter: one line per span or metric point on stdout.
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// Creates a new stdout exporter; a quiet one prints nothing.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TelemetryExporter for StdoutExporter {
    async fn export_spans(&self, batch: SpanBatch) -> Result<(), ExportError> {
        if self.verbose {
            for span in &batch.spans {
                println!(
                    "span trace_id={:032x} span_id={:016x} parent={} name={:?} duration={}ns status={:?} attributes={}",
                    span.trace_id,
                    span.span_id,
                    span.parent_span_id
                        .map_or_else(|| "-".to_string(), |p| format!("{p:016x}")),
                    span.name,
                    span.duration_nanos(),
                    span.status,
                    span.attributes.len(),
                );
            }
        }
        Ok(())
    }

    async fn export_metrics(&self, batch: MetricBatch) -> Result<(), ExportError> {
        if self.verbose {
            for point in &batch.points {
                println!(
                    "metric name={} kind={:?} value={} unit={}",
                    point.name, point.kind, point.value, point.unit
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Appends every span and metric point as one JSON object per line.
pub struct JsonLinesFileExporter {
    path: PathBuf,
}

impl JsonLinesFileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, lines: Vec<String>) -> Result<(), ExportError> {
        let mut buffer = lines.join("\n");
        buffer.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ExportError::Transport(format!("{}: {e}", self.path.display())))?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))
    }
}

/// JSON line for one span, ids in lowercase hex.
pub fn span_json_line(span: &FinishedSpan) -> Result<String, ExportError> {
    let line = json!({
        "type": "span",
        "trace_id": format!("{:032x}", span.trace_id),
        "span_id": format!("{:016x}", span.span_id),
        "parent_span_id": span.parent_span_id.map(|p| format!("{p:016x}")),
        "name": span.name,
        "kind": span.kind,
        "start_time_unix_nano": span.start_time,
        "end_time_unix_nano": span.end_time,
        "status": span.status,
        "status_message": span.status_message,
        "attributes": span.attributes,
        "events": span.events,
    });
    serde_json::to_string(&line).map_err(|e| ExportError::Serialization(e.to_string()))
}

/// JSON line for one metric point.
pub fn metric_json_line(point: &MetricPoint) -> Result<String, ExportError> {
    let line = json!({
        "type": "metric",
        "name": point.name,
        "kind": point.kind,
        "value": point.value,
        "unit": point.unit,
        "attributes": point.attributes,
        "time_unix_nano": point.timestamp,
    });
    serde_json::to_string(&line).map_err(|e| ExportError::Serialization(e.to_string()))
}

impl TelemetryExporter for JsonLinesFileExporter {
    async fn export_spans(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let lines = batch
            .spans
            .iter()
            .map(span_json_line)
            .collect::<Result<Vec<_>, _>>()?;
        self.append(lines).await
    }

    async fn export_metrics(&self, batch: MetricBatch) -> Result<(), ExportError> {
        let lines = batch
            .points
            .iter()
            .map(metric_json_line)
            .collect::<Result<Vec<_>, _>>()?;
        self.append(lines).await
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Null exporter that discards everything (for benchmarking)
#[derive(Debug, Default)]
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryExporter for NullExporter {
    async fn export_spans(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    async fn export_metrics(&self, _batch: MetricBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Keeps everything it is given, optionally after a delay.
///
/// Used by tests and the replay tool to inspect what would have been sent.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    delay: Option<Duration>,
    spans: Mutex<Vec<FinishedSpan>>,
    points: Mutex<Vec<MetricPoint>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` before accepting each batch (backpressure tests).
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().clone()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().clone()
    }

    pub fn spans_named(&self, name: &str) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl TelemetryExporter for InMemoryExporter {
    async fn export_spans(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.pause().await;
        self.spans.lock().extend(batch.spans);
        Ok(())
    }

    async fn export_metrics(&self, batch: MetricBatch) -> Result<(), ExportError> {
        self.pause().await;
        self.points.lock().extend(batch.points);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
pub(crate) type TestExporter = InMemoryExporter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TraceContext;
    use crate::metrics::MetricKind;
    use crate::span::{Attributes, Span, SpanKind, SpanStatus};

    fn finished(name: &str) -> FinishedSpan {
        let root = TraceContext::new_root(true);
        let mut span = Span::child_of(&root, name, SpanKind::Client);
        span.set_attribute("gen_ai.system", "anthropic");
        span.end(SpanStatus::Ok, None)
    }

    #[tokio::test]
    async fn test_stdout_exporter() {
        let exporter = StdoutExporter::new(false);
        let mut batch = SpanBatch::new();
        batch.add(finished("test"));
        assert!(exporter.export_spans(batch).await.is_ok());
        assert!(exporter.export_metrics(MetricBatch::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_exporter() {
        let exporter = InMemoryExporter::new();
        let batch = SpanBatch::with_spans((0..10).map(|i| finished(&format!("s{i}"))).collect());
        exporter.export_spans(batch).await.unwrap();
        assert_eq!(exporter.exported_count(), 10);
        assert_eq!(exporter.spans_named("s3").len(), 1);
    }

    #[tokio::test]
    async fn test_boxed_dispatch() {
        let exporter: Box<dyn TelemetryExporterBoxed> = Box::new(NullExporter::new());
        assert_eq!(exporter.name(), "null");
        exporter.export_spans_boxed(SpanBatch::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let exporter = JsonLinesFileExporter::new(&path);

        exporter
            .export_spans(SpanBatch::with_spans(vec![finished("a"), finished("b")]))
            .await
            .unwrap();
        exporter
            .export_metrics(MetricBatch::with_points(vec![MetricPoint {
                name: "amplifier.tool.calls".to_string(),
                kind: MetricKind::Counter,
                value: 1.0,
                unit: "{call}".to_string(),
                attributes: Attributes::new(),
                timestamp: 1,
            }]))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "span");
        assert_eq!(lines[0]["name"], "a");
        assert_eq!(lines[0]["trace_id"].as_str().unwrap().len(), 32);
        assert_eq!(lines[0]["attributes"]["gen_ai.system"], "anthropic");
        assert_eq!(lines[2]["type"], "metric");
        assert_eq!(lines[2]["value"], 1.0);
    }

    #[tokio::test]
    async fn test_json_lines_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonLinesFileExporter::new(dir.path().join("missing").join("x.jsonl"));
        let err = exporter
            .export_spans(SpanBatch::with_spans(vec![finished("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Transport(_)));
    }
}
