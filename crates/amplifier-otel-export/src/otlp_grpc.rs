//! OTLP over gRPC.

use crate::proto::{self, ResourceInfo};
use amplifier_otel::{ExportError, MetricBatch, OtelConfig, SpanBatch, TelemetryExporter};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::collections::HashMap;
use std::time::Duration;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Converts configured headers into gRPC request metadata.
pub(crate) fn metadata_map(headers: &HashMap<String, String>) -> Result<MetadataMap, ExportError> {
    let mut map = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = AsciiMetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| ExportError::InvalidConfig(format!("metadata key {name:?}: {e}")))?;
        let value = AsciiMetadataValue::try_from(value.as_str())
            .map_err(|e| ExportError::InvalidConfig(format!("metadata value for {name:?}: {e}")))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn status_error(status: tonic::Status) -> ExportError {
    match status.code() {
        tonic::Code::DeadlineExceeded => ExportError::Timeout,
        _ => ExportError::Transport(status.to_string()),
    }
}

/// Sends OTLP export requests over one lazily connected channel.
///
/// Construction does not touch the network, but it must happen inside a
/// tokio runtime.
pub struct OtlpGrpcExporter {
    traces: TraceServiceClient<Channel>,
    metrics: MetricsServiceClient<Channel>,
    metadata: MetadataMap,
    resource: ResourceInfo,
}

impl OtlpGrpcExporter {
    pub fn new(config: &OtelConfig) -> Result<Self, ExportError> {
        Self::with_timeout(config, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(config: &OtelConfig, timeout: Duration) -> Result<Self, ExportError> {
        let channel = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| ExportError::InvalidConfig(format!("endpoint {:?}: {e}", config.endpoint)))?
            .timeout(timeout)
            .connect_lazy();

        Ok(Self {
            traces: TraceServiceClient::new(channel.clone()),
            metrics: MetricsServiceClient::new(channel),
            metadata: metadata_map(&config.headers)?,
            resource: ResourceInfo::from_config(config),
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        request
    }
}

impl TelemetryExporter for OtlpGrpcExporter {
    async fn export_spans(&self, batch: SpanBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = self.request(proto::trace_request(&self.resource, &batch));
        debug!(spans = batch.len(), "sending OTLP traces");

        // Channel clients are cheap handles; each export gets its own.
        let mut client = self.traces.clone();
        let response = client.export(request).await.map_err(status_error)?;
        if let Some(partial) = response.into_inner().partial_success {
            if partial.rejected_spans > 0 {
                return Err(ExportError::Transport(format!(
                    "collector rejected {} spans: {}",
                    partial.rejected_spans, partial.error_message
                )));
            }
        }
        Ok(())
    }

    async fn export_metrics(&self, batch: MetricBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = self.request(proto::metrics_request(&self.resource, &batch));
        debug!(points = batch.len(), "sending OTLP metrics");

        let mut client = self.metrics.clone();
        let response = client.export(request).await.map_err(status_error)?;
        if let Some(partial) = response.into_inner().partial_success {
            if partial.rejected_data_points > 0 {
                return Err(ExportError::Transport(format!(
                    "collector rejected {} data points: {}",
                    partial.rejected_data_points, partial.error_message
                )));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "otlp-grpc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_keys_lowercased() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());

        let map = metadata_map(&headers).unwrap();
        assert_eq!(map.get("authorization").unwrap().to_str().unwrap(), "Bearer abc");
    }

    #[test]
    fn test_invalid_metadata_value_rejected() {
        let mut headers = HashMap::new();
        headers.insert("x-key".to_string(), "line\nbreak".to_string());
        assert!(matches!(metadata_map(&headers), Err(ExportError::InvalidConfig(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(tonic::Status::deadline_exceeded("slow")),
            ExportError::Timeout
        ));
        assert!(matches!(
            status_error(tonic::Status::unavailable("down")),
            ExportError::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let config = OtelConfig {
            endpoint: "not a uri".to_string(),
            ..OtelConfig::default()
        };
        assert!(matches!(OtlpGrpcExporter::new(&config), Err(ExportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_transport_error() {
        let config = OtelConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..OtelConfig::default()
        };
        let exporter = OtlpGrpcExporter::with_timeout(&config, Duration::from_millis(500)).unwrap();
        assert!(exporter.export_spans(SpanBatch::new()).await.is_ok());

        let batch = SpanBatch::with_spans(vec![amplifier_otel::FinishedSpan {
            trace_id: 1,
            span_id: 1,
            parent_span_id: None,
            sampled: true,
            name: "amplifier.session".to_string(),
            kind: amplifier_otel::SpanKind::Server,
            start_time: 0,
            end_time: 1,
            status: amplifier_otel::SpanStatus::Ok,
            status_message: None,
            attributes: Default::default(),
            events: Vec::new(),
        }]);
        let err = exporter.export_spans(batch).await.unwrap_err();
        assert!(matches!(err, ExportError::Transport(_) | ExportError::Timeout));
    }
}
