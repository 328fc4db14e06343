//! Kernel-facing entry point.
//!
//! [`OtelHook`] receives raw `(event name, JSON payload)` pairs from the
//! kernel's hook dispatcher, decodes them and forwards them to the
//! [`SpanManager`]. It observes only: nothing is returned to the dispatcher
//! and no payload is modified.
//!
//! The dispatcher is expected to run start-phase handlers at priority
//! [`PRIORITY_START`](crate::event::PRIORITY_START), end-phase handlers at
//! [`PRIORITY_END`](crate::event::PRIORITY_END) and everything else at
//! [`PRIORITY_INSTANT`](crate::event::PRIORITY_INSTANT). See
//! [`OtelHook::registrations`].

use crate::config::{opt_out_active, OtelConfig};
use crate::context::TraceContext;
use crate::event::{EventCategory, KernelEvent};
use crate::handoff::ExportHandle;
use crate::manager::SpanManager;
use crate::telemetry::Telemetry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// One entry of the hook registration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRegistration {
    pub event: &'static str,
    pub priority: i32,
}

/// Mounted OpenTelemetry hook; disabled hooks accept and ignore everything.
#[derive(Clone)]
pub struct OtelHook {
    manager: Option<Arc<SpanManager>>,
}

impl OtelHook {
    /// Builds a hook emitting into `export`.
    ///
    /// Returns a disabled hook when the process opted out or the
    /// configuration captures nothing.
    pub fn new(config: &OtelConfig, export: ExportHandle) -> Self {
        if opt_out_active() {
            info!("telemetry disabled by opt-out environment variable");
            return Self::disabled();
        }
        if !config.is_active() {
            debug!("telemetry disabled by configuration");
            return Self::disabled();
        }
        debug!(
            service = %config.service_name,
            sampling_rate = config.sampling_rate,
            "otel hook mounted"
        );
        Self {
            manager: Some(Arc::new(SpanManager::new(config, export))),
        }
    }

    pub fn disabled() -> Self {
        Self { manager: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    /// Event names and dispatch priorities the hook registers for.
    pub fn registrations() -> Vec<HookRegistration> {
        EventCategory::ALL
            .iter()
            .map(|category| HookRegistration {
                event: category.name(),
                priority: category.priority(),
            })
            .collect()
    }

    /// Handles one raw kernel event.
    pub fn on_event(&self, name: &str, data: &Value) {
        let Some(manager) = &self.manager else {
            return;
        };
        match KernelEvent::from_raw(name, data) {
            Ok(event) => manager.handle(&event),
            Err(e) => debug!(event = name, error = %e, "kernel event ignored"),
        }
    }

    /// Handles an already decoded event.
    pub fn on_kernel_event(&self, event: &KernelEvent) {
        if let Some(manager) = &self.manager {
            manager.handle(event);
        }
    }

    /// Root span context of a session, for log correlation.
    pub fn span_context(&self, session_id: &str) -> Option<TraceContext> {
        self.manager.as_ref()?.get_span_context(session_id)
    }

    /// W3C `traceparent` of a session root, to persist for `session:resume`.
    pub fn traceparent(&self, session_id: &str) -> Option<String> {
        self.span_context(session_id).map(|c| c.to_traceparent())
    }

    pub fn telemetry(&self) -> Telemetry {
        match &self.manager {
            Some(manager) => Telemetry::new(Arc::clone(manager)),
            None => Telemetry::disabled(),
        }
    }

    pub fn manager(&self) -> Option<&Arc<SpanManager>> {
        self.manager.as_ref()
    }

    /// Closes every open session.
    pub fn shutdown(&self) {
        if let Some(manager) = &self.manager {
            manager.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PRIORITY_END, PRIORITY_INSTANT, PRIORITY_START};
    use crate::handoff;
    use serde_json::json;

    #[test]
    fn test_registration_priorities() {
        let table = OtelHook::registrations();
        assert_eq!(table.len(), EventCategory::ALL.len());

        let priority = |event: &str| table.iter().find(|r| r.event == event).unwrap().priority;
        assert_eq!(priority("session:start"), PRIORITY_START);
        assert_eq!(priority("tool:pre"), PRIORITY_START);
        assert_eq!(priority("tool:post"), PRIORITY_END);
        assert_eq!(priority("session:end"), PRIORITY_END);
        assert_eq!(priority("context:compaction"), PRIORITY_INSTANT);
    }

    #[test]
    fn test_bad_events_ignored() {
        let (handle, mut receiver) = handoff::channel(16);
        let hook = OtelHook::new(&OtelConfig::default(), handle);
        hook.on_event("session:start", &json!({"session_id": "s1"}));
        hook.on_event("not:an:event", &json!({"session_id": "s1"}));
        hook.on_event("tool:pre", &json!({"tool_name": "bash"}));
        hook.on_event("tool:pre", &json!("not an object"));

        assert!(hook.span_context("s1").is_some());
        assert!(receiver.drain_spans().is_empty());
    }

    #[test]
    fn test_disabled_by_config() {
        let (handle, _receiver) = handoff::channel(16);
        let mut config = OtelConfig::default();
        config.enabled = false;
        let hook = OtelHook::new(&config, handle);

        assert!(!hook.is_enabled());
        hook.on_event("session:start", &json!({"session_id": "s1"}));
        assert!(hook.span_context("s1").is_none());
        assert!(!hook.telemetry().is_enabled());
    }

    #[test]
    fn test_traceparent_round_trip() {
        let (handle, _receiver) = handoff::channel(16);
        let hook = OtelHook::new(&OtelConfig::default(), handle);
        hook.on_event("session:start", &json!({"session_id": "s1"}));

        let traceparent = hook.traceparent("s1").unwrap();
        let parsed = TraceContext::from_traceparent(&traceparent).unwrap();
        assert_eq!(parsed.trace_id, hook.span_context("s1").unwrap().trace_id);
    }
}
