//! Conversion of finished spans and metric points into OTLP messages.
//!
//! Both transports send the same request messages; only the framing
//! differs. Metric points are single observations, so counters become
//! delta-temporality monotonic sums and histograms become one-sample
//! histograms with no explicit buckets.

use amplifier_otel::attributes::keys;
use amplifier_otel::metrics::MetricKind;
use amplifier_otel::{
    AttributeValue, Attributes, FinishedSpan, MetricBatch, MetricPoint, OtelConfig, SpanBatch,
    SpanKind, SpanStatus,
};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, ArrayValue, InstrumentationScope, KeyValue,
};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, AggregationTemporality, Histogram, HistogramDataPoint, Metric,
    NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, status, ResourceSpans, ScopeSpans, Span, Status};

/// Instrumentation scope name reported with every signal.
pub const SCOPE_NAME: &str = "amplifier-otel";

/// Process-wide identity attached to every request.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    attributes: Vec<KeyValue>,
    scope_version: String,
}

impl ResourceInfo {
    pub fn from_config(config: &OtelConfig) -> Self {
        let mut attributes = vec![
            key_value(keys::SERVICE_NAME, &config.service_name.as_str().into()),
            key_value(keys::SERVICE_VERSION, &config.service_version.as_str().into()),
            key_value(keys::USER_ID, &config.resolved_user_id().into()),
        ];
        if let Some(team_id) = &config.team_id {
            attributes.push(key_value(keys::TEAM_ID, &team_id.as_str().into()));
        }

        Self {
            attributes,
            scope_version: config.service_version.clone(),
        }
    }

    fn resource(&self) -> Option<Resource> {
        Some(Resource {
            attributes: self.attributes.clone(),
            ..Default::default()
        })
    }

    fn scope(&self) -> Option<InstrumentationScope> {
        Some(InstrumentationScope {
            name: SCOPE_NAME.to_string(),
            version: self.scope_version.clone(),
            ..Default::default()
        })
    }

    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }
}

// =============================================================================
// Attributes
// =============================================================================

fn any_value(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Float(f) => any_value::Value::DoubleValue(*f),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
        AttributeValue::Array(items) => any_value::Value::ArrayValue(ArrayValue {
            values: items
                .iter()
                .map(|item| AnyValue {
                    value: Some(any_value::Value::StringValue(item.clone())),
                })
                .collect(),
        }),
    };
    AnyValue { value: Some(value) }
}

fn key_value(key: &str, value: &AttributeValue) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(any_value(value)),
    }
}

fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| key_value(key, value))
        .collect()
}

// =============================================================================
// Traces
// =============================================================================

fn span_kind(kind: SpanKind) -> span::SpanKind {
    match kind {
        SpanKind::Internal => span::SpanKind::Internal,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Client => span::SpanKind::Client,
    }
}

fn span_status(finished: &FinishedSpan) -> Status {
    let code = match finished.status {
        SpanStatus::Ok => status::StatusCode::Ok,
        SpanStatus::Error => status::StatusCode::Error,
        SpanStatus::Unset => status::StatusCode::Unset,
    };
    Status {
        message: finished.status_message.clone().unwrap_or_default(),
        code: code as i32,
    }
}

pub fn span(finished: &FinishedSpan) -> Span {
    Span {
        trace_id: finished.trace_id.to_be_bytes().to_vec(),
        span_id: finished.span_id.to_be_bytes().to_vec(),
        parent_span_id: finished
            .parent_span_id
            .map(|id| id.to_be_bytes().to_vec())
            .unwrap_or_default(),
        name: finished.name.clone(),
        kind: span_kind(finished.kind) as i32,
        start_time_unix_nano: finished.start_time,
        end_time_unix_nano: finished.end_time,
        attributes: key_values(&finished.attributes),
        events: finished
            .events
            .iter()
            .map(|event| span::Event {
                time_unix_nano: event.timestamp,
                name: event.name.clone(),
                attributes: key_values(&event.attributes),
                ..Default::default()
            })
            .collect(),
        status: Some(span_status(finished)),
        ..Default::default()
    }
}

pub fn trace_request(resource: &ResourceInfo, batch: &SpanBatch) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: resource.resource(),
            scope_spans: vec![ScopeSpans {
                scope: resource.scope(),
                spans: batch.spans.iter().map(span).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

// =============================================================================
// Metrics
// =============================================================================

pub fn metric(point: &MetricPoint) -> Metric {
    let attributes = key_values(&point.attributes);
    let data = match point.kind {
        MetricKind::Counter => metric::Data::Sum(Sum {
            data_points: vec![NumberDataPoint {
                attributes,
                start_time_unix_nano: point.timestamp,
                time_unix_nano: point.timestamp,
                value: Some(number_data_point::Value::AsDouble(point.value)),
                ..Default::default()
            }],
            aggregation_temporality: AggregationTemporality::Delta as i32,
            is_monotonic: true,
        }),
        MetricKind::Histogram => metric::Data::Histogram(Histogram {
            data_points: vec![HistogramDataPoint {
                attributes,
                start_time_unix_nano: point.timestamp,
                time_unix_nano: point.timestamp,
                count: 1,
                sum: Some(point.value),
                bucket_counts: vec![1],
                min: Some(point.value),
                max: Some(point.value),
                ..Default::default()
            }],
            aggregation_temporality: AggregationTemporality::Delta as i32,
        }),
    };

    Metric {
        name: point.name.clone(),
        unit: point.unit.clone(),
        data: Some(data),
        ..Default::default()
    }
}

pub fn metrics_request(resource: &ResourceInfo, batch: &MetricBatch) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: resource.resource(),
            scope_metrics: vec![ScopeMetrics {
                scope: resource.scope(),
                metrics: batch.points.iter().map(metric).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}
