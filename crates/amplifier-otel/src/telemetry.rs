//! Bundle telemetry for host applications.

use crate::attributes::{keys, sanitize_source};
use crate::manager::SpanManager;
use crate::metrics::{BundleOperation, CompletedOperation};
use crate::span::{Attributes, SpanStatus};
use std::sync::Arc;
use tracing::debug;

/// Identity of a bundle as reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleInfo<'a> {
    pub name: &'a str,
    pub version: Option<&'a str>,
    /// Raw source; reported sanitized.
    pub source: Option<&'a str>,
}

impl<'a> BundleInfo<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: &'a str) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_source(mut self, source: &'a str) -> Self {
        self.source = Some(source);
        self
    }
}

/// Cheap, cloneable telemetry entry point. Every call is a no-op when
/// telemetry is disabled.
#[derive(Clone, Default)]
pub struct Telemetry {
    manager: Option<Arc<SpanManager>>,
}

impl Telemetry {
    pub fn disabled() -> Self {
        Self { manager: None }
    }

    pub(crate) fn new(manager: Arc<SpanManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    pub fn bundle_added(&self, bundle: BundleInfo<'_>) {
        self.record_bundle(bundle, BundleOperation::Add, None);
    }

    pub fn bundle_activated(&self, bundle: BundleInfo<'_>) {
        self.record_bundle(bundle, BundleOperation::Activate, None);
    }

    pub fn bundle_loaded(&self, bundle: BundleInfo<'_>, cached: bool) {
        self.record_bundle(bundle, BundleOperation::Load, Some(cached));
    }

    fn record_bundle(&self, bundle: BundleInfo<'_>, operation: BundleOperation, cached: Option<bool>) {
        let Some(manager) = &self.manager else {
            return;
        };

        let mut attributes = Attributes::new();
        attributes.insert(keys::BUNDLE_NAME.to_string(), bundle.name.into());
        attributes.insert(keys::BUNDLE_OPERATION.to_string(), operation.as_str().into());
        attributes.insert(
            keys::BUNDLE_SOURCE.to_string(),
            sanitize_source(bundle.source).into(),
        );
        if let Some(version) = bundle.version {
            attributes.insert(keys::BUNDLE_VERSION.to_string(), version.into());
        }
        if let Some(cached) = cached {
            attributes.insert(keys::BUNDLE_CACHED.to_string(), cached.into());
        }

        debug!(bundle = bundle.name, operation = operation.as_str(), "bundle telemetry");
        manager.record_standalone(
            &format!("bundle.{}", operation.as_str()),
            attributes,
            SpanStatus::Ok,
        );
        manager.record_metric(&CompletedOperation::BundleUsed {
            name: bundle.name,
            operation,
            version: bundle.version,
            source: bundle.source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OtelConfig;
    use crate::handoff::{self, ExportRecord};
    use crate::metrics::instruments;
    use crate::span::AttributeValue;

    #[test]
    fn test_bundle_loaded_emits_span_and_metric() {
        let (handle, mut receiver) = handoff::channel(16);
        let telemetry = Telemetry::new(Arc::new(SpanManager::new(&OtelConfig::default(), handle)));

        telemetry.bundle_loaded(
            BundleInfo::new("foundation")
                .with_version("1.2.0")
                .with_source("/home/alice/bundles/foundation"),
            true,
        );

        let records = receiver.drain();
        assert_eq!(records.len(), 2);
        let ExportRecord::Span(span) = &records[0] else {
            panic!("expected span first");
        };
        assert_eq!(span.name, "bundle.load");
        assert_eq!(span.parent_span_id, None);
        assert_eq!(span.attribute(keys::BUNDLE_SOURCE).and_then(AttributeValue::as_str), Some("local"));
        assert_eq!(span.attribute(keys::BUNDLE_CACHED), Some(&AttributeValue::Bool(true)));

        let ExportRecord::Metric(point) = &records[1] else {
            panic!("expected metric second");
        };
        assert_eq!(point.name, instruments::BUNDLE_USED.name);
        assert_eq!(
            point.attribute(keys::BUNDLE_OPERATION).and_then(AttributeValue::as_str),
            Some("load")
        );
        assert_eq!(
            point.attribute(keys::BUNDLE_SOURCE).and_then(AttributeValue::as_str),
            Some("local")
        );
    }

    #[test]
    fn test_disabled_is_noop() {
        let telemetry = Telemetry::disabled();
        assert!(!telemetry.is_enabled());
        telemetry.bundle_added(BundleInfo::new("x"));
    }
}
