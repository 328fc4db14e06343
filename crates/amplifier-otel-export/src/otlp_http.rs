//! OTLP over HTTP with protobuf bodies.

use crate::proto::{self, ResourceInfo};
use amplifier_otel::{ExportError, MetricBatch, OtelConfig, SpanBatch, TelemetryExporter};
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
const TRACES_PATH: &str = "/v1/traces";
const METRICS_PATH: &str = "/v1/metrics";

/// Per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parses configured headers into a header map.
pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, ExportError> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ExportError::InvalidConfig(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ExportError::InvalidConfig(format!("header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    map.insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));
    Ok(map)
}

fn transport_error(e: reqwest::Error) -> ExportError {
    if e.is_timeout() {
        ExportError::Timeout
    } else {
        ExportError::Transport(e.to_string())
    }
}

/// Posts OTLP protobuf requests to `{endpoint}/v1/traces` and
/// `{endpoint}/v1/metrics`.
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    traces_url: String,
    metrics_url: String,
    resource: ResourceInfo,
}

impl OtlpHttpExporter {
    pub fn new(config: &OtelConfig) -> Result<Self, ExportError> {
        Self::with_timeout(config, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(config: &OtelConfig, timeout: Duration) -> Result<Self, ExportError> {
        let endpoint = config.endpoint.trim_end_matches('/');
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ExportError::InvalidConfig(format!(
                "endpoint must be an http(s) URL: {endpoint:?}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(header_map(&config.headers)?)
            .build()
            .map_err(|e| ExportError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            traces_url: format!("{endpoint}{TRACES_PATH}"),
            metrics_url: format!("{endpoint}{METRICS_PATH}"),
            resource: ResourceInfo::from_config(config),
        })
    }

    pub fn traces_url(&self) -> &str {
        &self.traces_url
    }

    pub fn metrics_url(&self) -> &str {
        &self.metrics_url
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<(), ExportError> {
        let response = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ExportError::Transport(format!("{url} returned {status}: {text}")))
        }
    }
}

impl TelemetryExporter for OtlpHttpExporter {
    async fn export_spans(&self, batch: SpanBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = proto::trace_request(&self.resource, &batch).encode_to_vec();
        debug!(spans = batch.len(), bytes = body.len(), "posting OTLP traces");
        self.post(&self.traces_url, body).await
    }

    async fn export_metrics(&self, batch: MetricBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = proto::metrics_request(&self.resource, &batch).encode_to_vec();
        debug!(points = batch.len(), bytes = body.len(), "posting OTLP metrics");
        self.post(&self.metrics_url, body).await
    }

    fn name(&self) -> &str {
        "otlp-http"
    }
}
