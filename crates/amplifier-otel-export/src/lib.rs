//! OTLP backends for the Amplifier OpenTelemetry hook.
//!
//! `amplifier-otel` produces finished spans and metric points and hands them
//! to any [`TelemetryExporter`](amplifier_otel::TelemetryExporter). This
//! crate adds the two OTLP transports and [`mount`], which picks an exporter
//! from [`OtelConfig::exporter`](amplifier_otel::OtelConfig) and starts the
//! export pipeline behind the hook.
//!
//! ```no_run
//! use amplifier_otel::{ExporterKind, OtelConfig};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OtelConfig::default().with_exporter(ExporterKind::OtlpHttp);
//! let mounted = amplifier_otel_export::mount(&config)?;
//!
//! mounted.hook().on_event("session:start", &json!({"session_id": "s1"}));
//! mounted.hook().on_event("session:end", &json!({"session_id": "s1"}));
//!
//! mounted.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod mount;
pub mod otlp_grpc;
pub mod otlp_http;
pub mod proto;

pub use mount::{build_exporter, mount, mount_value, mount_with_exporter, MountError, Mounted};
pub use otlp_grpc::OtlpGrpcExporter;
pub use otlp_http::OtlpHttpExporter;
pub use proto::ResourceInfo;
