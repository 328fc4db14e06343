//! Configuration for the telemetry hook.
//!
//! Configuration arrives as a JSON object (the `config:` block of a module
//! mount). Every field has a default and unknown keys are ignored. The older
//! flat keys (`traces_enabled`, `filter_tool_parameters`, `max_payload_size`,
//! ...) are still honored and take precedence over the nested sections.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable that disables all telemetry for the process.
pub const OPT_OUT_ENV_VAR: &str = "AMPLIFIER_OTEL_OPT_OUT";

/// Marker substituted for redacted values.
pub const FILTERED_PLACEHOLDER: &str = "[FILTERED]";

/// Export backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExporterKind {
    #[default]
    Console,
    OtlpHttp,
    OtlpGrpc,
    File,
}

/// Which signals are produced at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub traces: bool,
    pub metrics: bool,
    /// Informational span events (e.g. the cancellation marker on the root).
    pub span_events: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            traces: true,
            metrics: true,
            span_events: true,
        }
    }
}

/// Classes of sensitive payload content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensitiveKind {
    LlmContent,
    UserInput,
    ToolParameters,
    ToolResults,
    ErrorMessages,
}

/// Redaction switches. All default to on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitiveDataConfig {
    /// Master switch; when off nothing is redacted.
    pub filter_sensitive_data: bool,
    pub filter_llm_content: bool,
    pub filter_user_input: bool,
    pub filter_tool_parameters: bool,
    pub filter_tool_results: bool,
    pub filter_error_messages: bool,
}

impl Default for SensitiveDataConfig {
    fn default() -> Self {
        Self {
            filter_sensitive_data: true,
            filter_llm_content: true,
            filter_user_input: true,
            filter_tool_parameters: true,
            filter_tool_results: true,
            filter_error_messages: true,
        }
    }
}

impl SensitiveDataConfig {
    /// Everything passes through unredacted.
    pub fn disabled() -> Self {
        Self {
            filter_sensitive_data: false,
            ..Self::default()
        }
    }

    pub fn should_filter(&self, kind: SensitiveKind) -> bool {
        if !self.filter_sensitive_data {
            return false;
        }
        match kind {
            SensitiveKind::LlmContent => self.filter_llm_content,
            SensitiveKind::UserInput => self.filter_user_input,
            SensitiveKind::ToolParameters => self.filter_tool_parameters,
            SensitiveKind::ToolResults => self.filter_tool_results,
            SensitiveKind::ErrorMessages => self.filter_error_messages,
        }
    }
}

/// Size class used to pick a payload limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    LlmContent,
    ToolPayload,
    Error,
    Default,
}

/// Limits for large payload values, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadLimitsConfig {
    /// Replace oversized values with a placeholder instead of truncating them.
    pub drop_large_payloads: bool,
    pub max_payload_size: usize,
    pub max_llm_content_size: usize,
    pub max_tool_payload_size: usize,
    pub max_error_size: usize,
    pub include_size_metadata: bool,
}

impl Default for PayloadLimitsConfig {
    fn default() -> Self {
        Self {
            drop_large_payloads: true,
            max_payload_size: 10_240,
            max_llm_content_size: 5_120,
            max_tool_payload_size: 5_120,
            max_error_size: 2_048,
            include_size_metadata: true,
        }
    }
}

impl PayloadLimitsConfig {
    pub fn limit_for(&self, payload_type: PayloadType) -> usize {
        match payload_type {
            PayloadType::LlmContent => self.max_llm_content_size,
            PayloadType::ToolPayload => self.max_tool_payload_size,
            PayloadType::Error => self.max_error_size,
            PayloadType::Default => self.max_payload_size,
        }
    }
}

/// Full hook configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelConfig {
    pub enabled: bool,
    pub service_name: String,
    pub service_version: String,
    /// Falls back to `$USER` when unset.
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub exporter: ExporterKind,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub file_path: String,
    pub sampling_rate: f64,
    pub max_attribute_length: usize,
    pub batch_delay_ms: u64,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub debug: bool,
    pub capture: CaptureConfig,
    pub sensitive_data: SensitiveDataConfig,
    pub payload_limits: PayloadLimitsConfig,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "amplifier".to_string(),
            service_version: "0.1.0".to_string(),
            user_id: None,
            team_id: None,
            exporter: ExporterKind::Console,
            endpoint: "http://localhost:4318".to_string(),
            headers: HashMap::new(),
            file_path: "amplifier-otel.jsonl".to_string(),
            sampling_rate: 1.0,
            max_attribute_length: 1000,
            batch_delay_ms: 5000,
            max_batch_size: 512,
            max_queue_size: 2048,
            debug: false,
            capture: CaptureConfig::default(),
            sensitive_data: SensitiveDataConfig::default(),
            payload_limits: PayloadLimitsConfig::default(),
        }
    }
}

/// Flat keys from the first configuration format.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyKeys {
    traces_enabled: Option<bool>,
    metrics_enabled: Option<bool>,
    filter_sensitive_data: Option<bool>,
    filter_llm_content: Option<bool>,
    filter_user_input: Option<bool>,
    filter_tool_parameters: Option<bool>,
    filter_tool_results: Option<bool>,
    filter_error_messages: Option<bool>,
    drop_large_payloads: Option<bool>,
    max_payload_size: Option<usize>,
    max_llm_content_size: Option<usize>,
    max_tool_payload_size: Option<usize>,
    max_error_size: Option<usize>,
}

impl LegacyKeys {
    fn apply(self, config: &mut OtelConfig) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *target = v;
            }
        }

        set(&mut config.capture.traces, self.traces_enabled);
        set(&mut config.capture.metrics, self.metrics_enabled);

        let sensitive = &mut config.sensitive_data;
        set(&mut sensitive.filter_sensitive_data, self.filter_sensitive_data);
        set(&mut sensitive.filter_llm_content, self.filter_llm_content);
        set(&mut sensitive.filter_user_input, self.filter_user_input);
        set(&mut sensitive.filter_tool_parameters, self.filter_tool_parameters);
        set(&mut sensitive.filter_tool_results, self.filter_tool_results);
        set(&mut sensitive.filter_error_messages, self.filter_error_messages);

        let limits = &mut config.payload_limits;
        set(&mut limits.drop_large_payloads, self.drop_large_payloads);
        set(&mut limits.max_payload_size, self.max_payload_size);
        set(&mut limits.max_llm_content_size, self.max_llm_content_size);
        set(&mut limits.max_tool_payload_size, self.max_tool_payload_size);
        set(&mut limits.max_error_size, self.max_error_size);
    }
}

impl OtelConfig {
    /// Parses a configuration object and applies the process opt-out.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut config = Self::from_value_ignoring_env(value)?;
        if opt_out_active() {
            config.enabled = false;
        }
        Ok(config)
    }

    /// Parses a configuration object without consulting the environment.
    pub fn from_value_ignoring_env(value: &Value) -> Result<Self, ConfigError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(ConfigError::NotAnObject);
        }

        let mut config: Self = serde_json::from_value(value.clone())?;
        let legacy: LegacyKeys = serde_json::from_value(value.clone())?;
        legacy.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::SamplingRate(self.sampling_rate));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroSized("max_queue_size"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroSized("max_batch_size"));
        }
        Ok(())
    }

    /// True when the hook should do any span or metric work.
    pub fn is_active(&self) -> bool {
        self.enabled && (self.capture.traces || self.capture.metrics)
    }

    /// Configured user id, else `$USER`, else `"unknown"`.
    pub fn resolved_user_id(&self) -> String {
        self.user_id
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Test-friendly preset: spans flushed quickly, nothing redacted.
    pub fn development() -> Self {
        Self {
            batch_delay_ms: 100,
            max_batch_size: 64,
            sensitive_data: SensitiveDataConfig::disabled(),
            ..Self::default()
        }
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn with_sensitive_data(mut self, sensitive_data: SensitiveDataConfig) -> Self {
        self.sensitive_data = sensitive_data;
        self
    }

    pub fn with_payload_limits(mut self, payload_limits: PayloadLimitsConfig) -> Self {
        self.payload_limits = payload_limits;
        self
    }

    pub fn with_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}

/// Interprets an opt-out value: `1`, `true`, `yes`, `on` (any case).
pub fn is_opt_out_value(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Whether the opt-out environment variable is set. Read once per process.
pub fn opt_out_active() -> bool {
    static OPT_OUT: OnceLock<bool> = OnceLock::new();
    *OPT_OUT.get_or_init(|| is_opt_out_value(std::env::var(OPT_OUT_ENV_VAR).ok().as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = OtelConfig::from_value_ignoring_env(&json!({})).unwrap();
        assert!(config.enabled);
        assert_eq!(config.service_name, "amplifier");
        assert_eq!(config.exporter, ExporterKind::Console);
        assert_eq!(config.endpoint, "http://localhost:4318");
        assert_eq!(config.sampling_rate, 1.0);
        assert_eq!(config.max_attribute_length, 1000);
        assert!(config.capture.traces && config.capture.metrics && config.capture.span_events);
        assert!(config.sensitive_data.filter_sensitive_data);
        assert!(config.payload_limits.drop_large_payloads);
        assert_eq!(config.payload_limits.limit_for(PayloadType::LlmContent), 5120);
        assert_eq!(config.payload_limits.limit_for(PayloadType::ToolPayload), 5120);
        assert_eq!(config.payload_limits.limit_for(PayloadType::Error), 2048);
        assert_eq!(config.payload_limits.limit_for(PayloadType::Default), 10240);
    }

    #[test]
    fn test_null_is_default() {
        let config = OtelConfig::from_value_ignoring_env(&Value::Null).unwrap();
        assert_eq!(config, OtelConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let config = OtelConfig::from_value_ignoring_env(&json!({
            "exporter": "otlp-grpc",
            "endpoint": "http://collector:4317",
            "headers": {"x-api-key": "k"},
            "capture": {"metrics": false},
            "sensitive_data": {"filter_tool_results": false},
            "payload_limits": {"drop_large_payloads": false, "max_error_size": 64}
        }))
        .unwrap();

        assert_eq!(config.exporter, ExporterKind::OtlpGrpc);
        assert_eq!(config.headers.get("x-api-key").map(String::as_str), Some("k"));
        assert!(config.capture.traces);
        assert!(!config.capture.metrics);
        assert!(!config.sensitive_data.should_filter(SensitiveKind::ToolResults));
        assert!(config.sensitive_data.should_filter(SensitiveKind::ToolParameters));
        assert!(!config.payload_limits.drop_large_payloads);
        assert_eq!(config.payload_limits.max_error_size, 64);
        assert_eq!(config.payload_limits.max_payload_size, 10240);
    }

    #[test]
    fn test_legacy_flat_keys_override_nested() {
        let config = OtelConfig::from_value_ignoring_env(&json!({
            "traces_enabled": false,
            "capture": {"traces": true},
            "filter_tool_parameters": false,
            "max_payload_size": 100
        }))
        .unwrap();

        assert!(!config.capture.traces);
        assert!(!config.sensitive_data.filter_tool_parameters);
        assert_eq!(config.payload_limits.max_payload_size, 100);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = OtelConfig::from_value_ignoring_env(&json!({
            "enabled": true,
            "no_such_option": 42
        }))
        .unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            OtelConfig::from_value_ignoring_env(&json!({"sampling_rate": 1.5})),
            Err(ConfigError::SamplingRate(_))
        ));
        assert!(matches!(
            OtelConfig::from_value_ignoring_env(&json!({"exporter": "carrier-pigeon"})),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            OtelConfig::from_value_ignoring_env(&json!([1, 2])),
            Err(ConfigError::NotAnObject)
        ));
    }

    #[test]
    fn test_master_switch_disables_all_filtering() {
        let sensitive = SensitiveDataConfig::disabled();
        for kind in [
            SensitiveKind::LlmContent,
            SensitiveKind::UserInput,
            SensitiveKind::ToolParameters,
            SensitiveKind::ToolResults,
            SensitiveKind::ErrorMessages,
        ] {
            assert!(!sensitive.should_filter(kind));
        }
    }

    #[test]
    fn test_is_active() {
        let mut config = OtelConfig::default();
        assert!(config.is_active());
        config.capture.traces = false;
        config.capture.metrics = false;
        assert!(!config.is_active());
        config.capture.metrics = true;
        config.enabled = false;
        assert!(!config.is_active());
    }

    #[test]
    fn test_opt_out_values() {
        for v in ["1", "true", "TRUE", "yes", "On", " on "] {
            assert!(is_opt_out_value(Some(v)), "{v}");
        }
        for v in ["0", "false", "no", "off", "", "maybe"] {
            assert!(!is_opt_out_value(Some(v)), "{v}");
        }
        assert!(!is_opt_out_value(None));
    }
}
