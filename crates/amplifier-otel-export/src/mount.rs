//! Wires a configured exporter, the export pipeline and the hook together.

use crate::otlp_grpc::OtlpGrpcExporter;
use crate::otlp_http::OtlpHttpExporter;
use amplifier_otel::config::opt_out_active;
use amplifier_otel::{
    ConfigError, ExportError, ExportMetrics, ExportPipeline, ExportPipelineConfig, ExporterKind,
    HandoffMetrics, JsonLinesFileExporter, OtelConfig, OtelHook, PipelineError, StdoutExporter,
    Telemetry, TelemetryExporterBoxed,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot build exporter: {0}")]
    Exporter(#[from] ExportError),
}

/// Builds the exporter selected by `config.exporter`.
pub fn build_exporter(config: &OtelConfig) -> Result<Arc<dyn TelemetryExporterBoxed>, ExportError> {
    let exporter: Arc<dyn TelemetryExporterBoxed> = match config.exporter {
        ExporterKind::Console => Arc::new(StdoutExporter::new(true)),
        ExporterKind::File => Arc::new(JsonLinesFileExporter::new(&config.file_path)),
        ExporterKind::OtlpHttp => Arc::new(OtlpHttpExporter::new(config)?),
        ExporterKind::OtlpGrpc => Arc::new(OtlpGrpcExporter::new(config)?),
    };
    Ok(exporter)
}

/// A mounted hook and the pipeline feeding its exporter.
pub struct Mounted {
    hook: OtelHook,
    pipeline: Option<ExportPipeline>,
}

impl Mounted {
    fn disabled() -> Self {
        Self {
            hook: OtelHook::disabled(),
            pipeline: None,
        }
    }

    pub fn hook(&self) -> &OtelHook {
        &self.hook
    }

    pub fn telemetry(&self) -> Telemetry {
        self.hook.telemetry()
    }

    pub fn is_enabled(&self) -> bool {
        self.hook.is_enabled()
    }

    pub fn export_metrics(&self) -> Option<&Arc<ExportMetrics>> {
        self.pipeline.as_ref().map(ExportPipeline::export_metrics)
    }

    pub fn handoff_metrics(&self) -> Option<&Arc<HandoffMetrics>> {
        self.hook
            .manager()
            .map(|manager| manager.export_handle().metrics())
    }

    /// Closes open sessions, then drains and stops the pipeline.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        self.hook.shutdown();
        match self.pipeline {
            Some(pipeline) => pipeline.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Mounts the hook with the exporter named in `config`.
///
/// Must be called from within a tokio runtime. Opt-out and inactive
/// configurations produce a disabled hook and no pipeline.
pub fn mount(config: &OtelConfig) -> Result<Mounted, MountError> {
    if opt_out_active() || !config.is_active() {
        info!("telemetry disabled; hook mounted as no-op");
        return Ok(Mounted::disabled());
    }
    let exporter = build_exporter(config)?;
    Ok(mount_with_exporter(config, exporter))
}

/// Parses a raw `config:` block and mounts it.
pub fn mount_value(value: &Value) -> Result<Mounted, MountError> {
    let config = OtelConfig::from_value(value)?;
    mount(&config)
}

/// Mounts the hook in front of an already built exporter.
pub fn mount_with_exporter(config: &OtelConfig, exporter: Arc<dyn TelemetryExporterBoxed>) -> Mounted {
    if opt_out_active() || !config.is_active() {
        return Mounted::disabled();
    }
    let pipeline = ExportPipeline::spawn(ExportPipelineConfig::from_config(config), exporter);
    let hook = OtelHook::new(config, pipeline.handle());
    debug!(exporter = pipeline.exporter_name(), "telemetry mounted");

    Mounted {
        hook,
        pipeline: Some(pipeline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amplifier_otel::CaptureConfig;

    #[test]
    fn test_build_exporter_names() {
        let console = build_exporter(&OtelConfig::default()).unwrap();
        assert_eq!(console.name(), "console");

        let dir = tempfile::tempdir().unwrap();
        let mut config = OtelConfig::default().with_exporter(ExporterKind::File);
        config.file_path = dir.path().join("out.jsonl").display().to_string();
        assert_eq!(build_exporter(&config).unwrap().name(), "file");

        let http = OtelConfig::default().with_exporter(ExporterKind::OtlpHttp);
        assert_eq!(build_exporter(&http).unwrap().name(), "otlp-http");
    }

    #[test]
    fn test_bad_otlp_endpoint_fails_mount() {
        let mut config = OtelConfig::default().with_exporter(ExporterKind::OtlpHttp);
        config.endpoint = "localhost:4318".to_string();
        assert!(matches!(build_exporter(&config), Err(ExportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_inactive_config_mounts_disabled() {
        let config = OtelConfig {
            capture: CaptureConfig {
                traces: false,
                metrics: false,
                span_events: true,
            },
            ..OtelConfig::default()
        };
        let mounted = mount(&config).unwrap();
        assert!(!mounted.is_enabled());
        assert!(mounted.export_metrics().is_none());
        assert!(mounted.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_mount_value_rejects_bad_config() {
        let result = mount_value(&serde_json::json!({"sampling_rate": 2.0}));
        assert!(matches!(result, Err(MountError::Config(ConfigError::SamplingRate(_)))));
    }
}
