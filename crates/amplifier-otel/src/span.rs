use crate::context::TraceContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Ordered attribute map attached to spans, span events and metric points.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Attribute value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::Array(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    Unset,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side span; used for session roots
    Server,
    /// Client-side span; used for LLM calls
    Client,
}

/// Timestamped annotation recorded on a span while it is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub timestamp: u64,
    pub name: String,
    pub attributes: Attributes,
}

/// Current wall clock as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// An open span owned by its session tree.
///
/// A span is ended exactly once: [`Span::end`] consumes it and yields the
/// immutable [`FinishedSpan`] that is handed to the export queue. Attributes
/// and events can only be added while the span is still open.
#[derive(Debug)]
pub struct Span {
    context: TraceContext,
    name: String,
    kind: SpanKind,
    start_time: u64,
    attributes: Attributes,
    events: Vec<SpanEvent>,
}

impl Span {
    /// Starts a span with an already-allocated context.
    pub fn start(context: TraceContext, name: impl Into<String>, kind: SpanKind) -> Self {
        Self {
            context,
            name: name.into(),
            kind,
            start_time: now_unix_nanos(),
            attributes: Attributes::new(),
            events: Vec::new(),
        }
    }

    /// Starts a child of `parent`, inheriting its trace id and sampling flag.
    pub fn child_of(parent: &TraceContext, name: impl Into<String>, kind: SpanKind) -> Self {
        Self::start(parent.child(), name, kind)
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Merges a mapped attribute set; later keys overwrite earlier ones.
    pub fn extend_attributes(&mut self, attributes: Attributes) {
        self.attributes.extend(attributes);
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: Attributes) {
        self.events.push(SpanEvent {
            timestamp: now_unix_nanos(),
            name: name.into(),
            attributes,
        });
    }

    /// Ends the span now.
    pub fn end(self, status: SpanStatus, status_message: Option<String>) -> FinishedSpan {
        self.end_at(now_unix_nanos(), status, status_message)
    }

    /// Ends the span at an explicit timestamp (clamped to the start time).
    pub fn end_at(
        self,
        end_time: u64,
        status: SpanStatus,
        status_message: Option<String>,
    ) -> FinishedSpan {
        FinishedSpan {
            trace_id: self.context.trace_id,
            span_id: self.context.span_id,
            parent_span_id: self.context.parent_span_id,
            sampled: self.context.sampled,
            name: self.name,
            kind: self.kind,
            start_time: self.start_time,
            end_time: end_time.max(self.start_time),
            status,
            status_message,
            attributes: self.attributes,
            events: self.events,
        }
    }
}

/// Immutable record of a completed span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedSpan {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (`None` for a trace root)
    pub parent_span_id: Option<u64>,
    pub sampled: bool,
    /// Operation name
    pub name: String,
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    pub status: SpanStatus,
    pub status_message: Option<String>,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
}

impl FinishedSpan {
    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_nanos() as f64 / 1_000_000_000.0
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }
}

/// Batch of finished spans for export
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<FinishedSpan>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<FinishedSpan>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: FinishedSpan) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_trace_and_sampling() {
        let root = TraceContext::new_root(false);
        let child = Span::child_of(&root, "child", SpanKind::Internal);

        assert_eq!(child.context().trace_id, root.trace_id);
        assert_eq!(child.context().parent_span_id, Some(root.span_id));
        assert!(!child.context().sampled);
        assert_ne!(child.context().span_id, root.span_id);
    }

    #[test]
    fn test_end_carries_attributes_and_events() {
        let mut span = Span::start(TraceContext::new_root(true), "op", SpanKind::Client);
        span.set_attribute("gen_ai.request.model", "m");
        span.set_attribute("gen_ai.usage.input_tokens", 10_i64);
        span.add_event("marker", Attributes::new());

        let finished = span.end(SpanStatus::Ok, None);
        assert_eq!(finished.name, "op");
        assert_eq!(finished.kind, SpanKind::Client);
        assert_eq!(finished.status, SpanStatus::Ok);
        assert_eq!(
            finished.attribute("gen_ai.request.model").and_then(AttributeValue::as_str),
            Some("m")
        );
        assert!(finished.has_event("marker"));
        assert!(finished.end_time >= finished.start_time);
    }

    #[test]
    fn test_end_at_clamps_to_start() {
        let span = Span::start(TraceContext::new_root(true), "op", SpanKind::Internal);
        let start = span.start_time();
        let finished = span.end_at(0, SpanStatus::Unset, None);
        assert_eq!(finished.end_time, start);
        assert_eq!(finished.duration_nanos(), 0);
    }

    #[test]
    fn test_attribute_value_serializes_untagged() {
        let json = serde_json::to_string(&AttributeValue::from("x")).unwrap();
        assert_eq!(json, "\"x\"");
        let json = serde_json::to_string(&AttributeValue::from(true)).unwrap();
        assert_eq!(json, "true");
    }
}
