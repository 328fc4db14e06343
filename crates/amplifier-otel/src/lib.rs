//! Amplifier OpenTelemetry hook engine
//!
//! Turns the lifecycle events of an agent-execution kernel into hierarchical
//! traces and aggregate metrics without ever blocking or altering the event
//! stream that drives it.
//!
//! # Key Features
//!
//! - One span tree per session with a LIFO stack of in-flight tool spans
//! - W3C trace context propagated from parent sessions to forked children
//! - Semantic-convention attributes with sensitive payload redaction
//! - Non-blocking bounded handoff to a background batching exporter
//!
//! # Example
//!
//! ```
//! use amplifier_otel::{handoff, OtelConfig, OtelHook};
//! use serde_json::json;
//!
//! let (export, mut receiver) = handoff::channel(1024);
//! let hook = OtelHook::new(&OtelConfig::default(), export);
//!
//! hook.on_event("session:start", &json!({"session_id": "s1"}));
//! hook.on_event("tool:pre", &json!({"session_id": "s1", "tool_name": "bash"}));
//! hook.on_event("tool:post", &json!({"session_id": "s1", "tool_name": "bash"}));
//! hook.on_event("session:end", &json!({"session_id": "s1", "status": "completed"}));
//!
//! let spans = receiver.drain_spans();
//! assert_eq!(spans.len(), 2);
//! assert_eq!(spans[0].name, "execute_tool bash");
//! assert_eq!(spans[1].name, "amplifier.session");
//! ```

pub mod attributes;
pub mod batch_processor;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod exporter;
pub mod handoff;
pub mod hook;
mod invariants;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod session;
pub mod span;
pub mod telemetry;

pub use attributes::{sanitize_source, AttributeMapper, FilterConfig};
pub use batch_processor::{BatchConfig, BatchMetrics, BatchProcessor, ExportBatch};
pub use config::{
    CaptureConfig, ExporterKind, OtelConfig, PayloadLimitsConfig, SensitiveDataConfig,
};
pub use context::{TraceContext, TraceContextError};
pub use error::{ConfigError, EventError};
pub use event::{EventCategory, EventPayload, KernelEvent};
pub use exporter::{
    ExportError, InMemoryExporter, JsonLinesFileExporter, NullExporter, StdoutExporter,
    TelemetryExporter, TelemetryExporterBoxed,
};
pub use handoff::{ExportHandle, ExportReceiver, HandoffMetrics, SubmitError};
pub use hook::{HookRegistration, OtelHook};
pub use manager::SpanManager;
pub use metrics::{MetricBatch, MetricPoint, MetricsRecorder};
pub use pipeline::{ExportMetrics, ExportPipeline, ExportPipelineConfig, PipelineError};
pub use session::SessionSpanTree;
pub use span::{AttributeValue, Attributes, FinishedSpan, Span, SpanBatch, SpanKind, SpanStatus};
pub use telemetry::{BundleInfo, Telemetry};
