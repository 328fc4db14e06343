//! Session registry and event-driven span lifecycle.
//!
//! The [`SpanManager`] owns one [`SessionSpanTree`] per active session in a
//! sharded concurrent map. Each tree sits behind its own mutex, so events for
//! different sessions never contend while events for one session are applied
//! by a single writer at a time. The map guard is always released before a
//! tree lock is taken.
//!
//! No path in here returns an error to the caller: unknown sessions, stray
//! end events and malformed payloads are logged and ignored.

use crate::attributes::{keys, AttributeMapper, FilterConfig};
use crate::config::OtelConfig;
use crate::context::{should_sample, TraceContext};
use crate::event::{
    ErrorInfo, EventPayload, KernelEvent, LlmResponse, ProviderError, SessionEnd, SessionOutcome,
};
use crate::handoff::ExportHandle;
use crate::invariants::debug_assert_child_of;
use crate::metrics::{CompletedOperation, MetricsRecorder, SessionType};
use crate::session::{PairedOperation, SessionSpanTree};
use crate::span::{AttributeValue, Attributes, FinishedSpan, Span, SpanKind, SpanStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Span event recorded on spans closed because their session ended.
pub const ORPHAN_EVENT: &str = "session ended while span open";
/// Span event recorded on roots closed by [`SpanManager::shutdown`].
pub const SHUTDOWN_EVENT: &str = "engine shutdown while session open";
/// Informational root event for a cancellation request.
pub const CANCEL_REQUESTED_EVENT: &str = "cancel.requested";

const UNKNOWN: &str = "unknown";

/// `None` once the session has been closed.
type SessionSlot = Arc<Mutex<Option<SessionSpanTree>>>;

/// Registry of active session trees plus the collaborators they emit to.
pub struct SpanManager {
    sessions: DashMap<String, SessionSlot>,
    mapper: AttributeMapper,
    metrics: Option<MetricsRecorder>,
    export: ExportHandle,
    export_traces: bool,
    span_events: bool,
    sampling_rate: f64,
    default_user_id: String,
    team_id: Option<String>,
}

impl SpanManager {
    pub fn new(config: &OtelConfig, export: ExportHandle) -> Self {
        let metrics = config
            .capture
            .metrics
            .then(|| MetricsRecorder::new(export.clone()));
        Self {
            sessions: DashMap::new(),
            mapper: AttributeMapper::new(FilterConfig::from_config(config)),
            metrics,
            export,
            export_traces: config.capture.traces,
            span_events: config.capture.span_events,
            sampling_rate: config.sampling_rate,
            default_user_id: config.resolved_user_id(),
            team_id: config.team_id.clone(),
        }
    }

    pub fn mapper(&self) -> &AttributeMapper {
        &self.mapper
    }

    pub fn export_handle(&self) -> &ExportHandle {
        &self.export
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Root span context of an active session, for log correlation.
    pub fn get_span_context(&self, session_id: &str) -> Option<TraceContext> {
        self.with_tree(session_id, |tree| tree.trace_context())
    }

    /// Context of the innermost open span of an active session.
    pub fn get_innermost_context(&self, session_id: &str) -> Option<TraceContext> {
        self.with_tree(session_id, |tree| tree.innermost_context())
    }

    /// Applies one kernel event.
    pub fn handle(&self, event: &KernelEvent) {
        let session_id = event.session_id.as_str();
        trace!(session_id, event = %event.category(), "handling event");

        match &event.payload {
            EventPayload::SessionStart(start) => match start.parent_id.as_deref() {
                Some(parent_id) if !self.sessions.contains_key(session_id) => {
                    self.fork_session(session_id, Some(parent_id), &event.payload);
                }
                _ => {
                    let context = self.new_root_context();
                    self.open_session(
                        session_id,
                        SessionType::New,
                        context,
                        &event.payload,
                        start.user_id.as_deref(),
                    );
                }
            },
            EventPayload::SessionFork(fork) => {
                self.fork_session(session_id, fork.parent_id.as_deref(), &event.payload);
            }
            EventPayload::SessionResume(resume) => {
                let context = match resume.traceparent.as_deref().map(TraceContext::from_traceparent) {
                    Some(Ok(remote)) => remote.child(),
                    Some(Err(e)) => {
                        warn!(session_id, error = %e, "ignoring invalid persisted traceparent");
                        self.new_root_context()
                    }
                    None => self.new_root_context(),
                };
                self.open_session(
                    session_id,
                    SessionType::Resume,
                    context,
                    &event.payload,
                    resume.user_id.as_deref(),
                );
            }
            EventPayload::SessionEnd(end) => self.end_session(session_id, end, &event.payload),
            payload => {
                let applied = self.with_tree(session_id, |tree| self.apply(tree, payload));
                if applied.is_none() {
                    debug!(session_id, event = %event.category(), "event for unknown session ignored");
                }
            }
        }
    }

    /// Closes every remaining session and clears the registry.
    pub fn shutdown(&self) {
        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            let Some((_, slot)) = self.sessions.remove(&session_id) else {
                continue;
            };
            let Some(mut tree) = slot.lock().take() else {
                continue;
            };
            debug!(session_id, "closing session at shutdown");
            tree.root_mut().add_event(SHUTDOWN_EVENT, Attributes::new());
            for span in tree.close(SpanStatus::Unset, None, ORPHAN_EVENT) {
                self.submit(span);
            }
        }
    }

    /// Emits a complete span that belongs to no session.
    pub fn record_standalone(&self, name: &str, attributes: Attributes, status: SpanStatus) {
        let mut span = Span::start(self.new_root_context(), name, SpanKind::Internal);
        span.extend_attributes(attributes);
        self.submit(span.end(status, None));
    }

    pub(crate) fn record_metric(&self, operation: &CompletedOperation<'_>) {
        if let Some(metrics) = &self.metrics {
            metrics.record(operation);
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    fn new_root_context(&self) -> TraceContext {
        let mut context = TraceContext::new_root(true);
        context.sampled = should_sample(context.trace_id, self.sampling_rate);
        context
    }

    fn root_attributes(&self, session_type: SessionType, payload: &EventPayload) -> Attributes {
        let mut attributes = self.mapper.map(payload);
        attributes.insert(keys::SESSION_TYPE.to_string(), session_type.as_str().into());
        attributes
            .entry(keys::USER_ID.to_string())
            .or_insert_with(|| self.default_user_id.as_str().into());
        if let Some(team_id) = &self.team_id {
            attributes.insert(keys::TEAM_ID.to_string(), team_id.as_str().into());
        }
        attributes
    }

    fn open_session(
        &self,
        session_id: &str,
        session_type: SessionType,
        context: TraceContext,
        payload: &EventPayload,
        user_id: Option<&str>,
    ) {
        let attributes = self.root_attributes(session_type, payload);

        let existing = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let tree = SessionSpanTree::new(session_id, context, attributes);
                debug!(
                    session_id,
                    trace_id = %format_args!("{:032x}", context.trace_id),
                    sampled = context.sampled,
                    session_type = session_type.as_str(),
                    "session opened"
                );
                entry.insert(Arc::new(Mutex::new(Some(tree))));
                self.record_metric(&CompletedOperation::SessionStarted {
                    session_type,
                    user_id: Some(user_id.unwrap_or(&self.default_user_id)),
                });
                return;
            }
        };

        // Already active (e.g. created by session:fork); keep the existing
        // root and only merge what this event adds.
        if let Some(tree) = existing.lock().as_mut() {
            let root = tree.root_mut();
            for (key, value) in attributes {
                if key != keys::SESSION_TYPE {
                    root.set_attribute(key, value);
                }
            }
        }
        debug!(session_id, "duplicate session start merged into existing root");
    }

    fn fork_session(&self, child_id: &str, parent_id: Option<&str>, payload: &EventPayload) {
        let parent_context =
            parent_id.and_then(|parent_id| self.get_innermost_context(parent_id));

        let context = match parent_context {
            Some(parent) => {
                let child = parent.child();
                debug_assert_child_of!(child, parent);
                child
            }
            None => {
                warn!(
                    session_id = child_id,
                    parent_id = parent_id.unwrap_or(UNKNOWN),
                    "fork parent not active; starting a new trace"
                );
                self.new_root_context()
            }
        };

        let user_id = match payload {
            EventPayload::SessionFork(fork) => fork.user_id.as_deref(),
            EventPayload::SessionStart(start) => start.user_id.as_deref(),
            _ => None,
        };
        self.open_session(child_id, SessionType::Fork, context, payload, user_id);
    }

    fn end_session(&self, session_id: &str, end: &SessionEnd, payload: &EventPayload) {
        let Some((_, slot)) = self.sessions.remove(session_id) else {
            debug!(session_id, "session:end for unknown session ignored");
            return;
        };
        let Some(mut tree) = slot.lock().take() else {
            return;
        };

        let outcome = end.outcome.unwrap_or(if tree.cancel_requested() {
            SessionOutcome::Cancelled
        } else {
            SessionOutcome::Completed
        });

        let root = tree.root_mut();
        root.extend_attributes(self.mapper.map(payload));
        root.set_attribute(keys::SESSION_STATUS, outcome.as_str());
        let (status, message) = match outcome {
            SessionOutcome::Completed => (SpanStatus::Ok, None),
            SessionOutcome::Cancelled => {
                root.set_attribute(keys::SESSION_CANCELLED, true);
                (SpanStatus::Ok, None)
            }
            SessionOutcome::Error => (
                SpanStatus::Error,
                end.error.as_ref().and_then(|e| self.mapper.error_description(e)),
            ),
        };

        let open_tools = tree.tool_depth();
        if open_tools > 0 {
            warn!(session_id, open_tools, "session ended with tool spans still open");
        }
        debug!(session_id, status = outcome.as_str(), turns = tree.turn_count(), "session closed");

        let finished = tree.close(status, message, ORPHAN_EVENT);
        if let Some(root) = finished.last() {
            self.record_metric(&CompletedOperation::SessionEnded {
                status: outcome.as_str(),
                duration_secs: root.duration_secs(),
            });
        }
        for span in finished {
            self.submit(span);
        }
    }

    // =========================================================================
    // In-session events
    // =========================================================================

    fn apply(&self, tree: &mut SessionSpanTree, payload: &EventPayload) {
        let attributes = self.mapper.map(payload);
        let session_id = tree.session_id().to_string();

        match payload {
            EventPayload::ExecutionStart => {
                if let Some(previous) = tree.start_turn(attributes) {
                    warn!(session_id = %session_id, "execution:start while a turn was open; closing it");
                    self.submit(previous);
                }
            }
            EventPayload::ExecutionEnd => self.close_turn(tree),
            EventPayload::OrchestratorComplete => {
                tree.root_mut().set_attribute(keys::ORCHESTRATOR_COMPLETED, true);
                self.close_turn(tree);
            }

            EventPayload::LlmRequest(request) => {
                let model = request.model.as_deref().unwrap_or(UNKNOWN);
                let span = tree.start_child(format!("chat {model}"), SpanKind::Client, attributes);
                if let Some(previous) = tree.begin_llm(span) {
                    warn!(session_id = %session_id, "llm:request while a call was open; closing it");
                    self.submit(previous);
                }
            }
            EventPayload::LlmResponse(response) => self.finish_llm_response(tree, response, attributes),
            EventPayload::ProviderError(error) => self.finish_llm_error(tree, error, attributes),

            EventPayload::ToolPre(pre) => {
                let tool_name = pre.tool_name.as_deref().unwrap_or(UNKNOWN);
                let mut attributes = attributes;
                attributes
                    .entry(keys::TOOL_NAME.to_string())
                    .or_insert_with(|| tool_name.into());
                tree.push_tool(tool_name, attributes);
            }
            EventPayload::ToolPost(post) => {
                let status = if post.success { SpanStatus::Ok } else { SpanStatus::Error };
                let error_type = (!post.success).then_some("tool_failure");
                self.finish_tool(tree, post.tool_name.as_deref(), attributes, status, None, error_type);
            }
            EventPayload::ToolError(error) => {
                let message = error
                    .error
                    .as_ref()
                    .and_then(|e| self.mapper.error_description(e));
                let error_type = attributes
                    .get(keys::ERROR_TYPE)
                    .and_then(AttributeValue::as_str)
                    .map(str::to_string);
                self.finish_tool(
                    tree,
                    error.tool_name.as_deref(),
                    attributes,
                    SpanStatus::Error,
                    message,
                    error_type.as_deref(),
                );
            }

            EventPayload::PromptSubmit(_) => {
                self.begin_paired(tree, PairedOperation::Prompt, attributes);
            }
            EventPayload::PromptComplete => {
                self.end_paired(tree, PairedOperation::Prompt, attributes);
            }
            EventPayload::PlanStart(_) => self.begin_paired(tree, PairedOperation::Plan, attributes),
            EventPayload::PlanEnd => self.end_paired(tree, PairedOperation::Plan, attributes),
            EventPayload::ApprovalRequired(_) => {
                self.begin_paired(tree, PairedOperation::Approval, attributes);
            }
            EventPayload::ApprovalGranted | EventPayload::ApprovalDenied(_) => {
                self.end_paired(tree, PairedOperation::Approval, attributes);
            }
            EventPayload::CancelRequested(cancel) => {
                tree.mark_cancel_requested();
                if self.span_events {
                    let mut event_attributes = Attributes::new();
                    if let Some(immediate) = cancel.immediate {
                        event_attributes.insert(keys::CANCEL_IMMEDIATE.to_string(), immediate.into());
                    }
                    tree.root_mut().add_event(CANCEL_REQUESTED_EVENT, event_attributes);
                }
                self.begin_paired(tree, PairedOperation::Cancellation, attributes);
            }
            EventPayload::CancelCompleted => {
                self.end_paired(tree, PairedOperation::Cancellation, attributes);
            }

            EventPayload::ContextCompaction(_) => {
                self.instant(tree, "context_compaction", attributes, SpanStatus::Ok, None);
            }
            EventPayload::ContextInclude(_) => {
                self.instant(tree, "context_include", attributes, SpanStatus::Ok, None);
            }
            EventPayload::ArtifactWrite(_) => {
                self.instant(tree, "artifact_write", attributes, SpanStatus::Ok, None);
            }
            EventPayload::ArtifactRead(_) => {
                self.instant(tree, "artifact_read", attributes, SpanStatus::Ok, None);
            }
            EventPayload::PolicyViolation(violation) => {
                self.instant(
                    tree,
                    "policy_violation",
                    attributes,
                    SpanStatus::Error,
                    Some(violation.violation_type.clone()),
                );
            }

            EventPayload::SessionStart(_)
            | EventPayload::SessionFork(_)
            | EventPayload::SessionResume(_)
            | EventPayload::SessionEnd(_) => {}
        }
    }

    fn close_turn(&self, tree: &mut SessionSpanTree) {
        if let Some(turn) = tree.end_turn() {
            self.submit(turn);
            self.record_metric(&CompletedOperation::TurnCompleted {
                turn_number: tree.turn_count(),
            });
        }
    }

    fn finish_tool(
        &self,
        tree: &mut SessionSpanTree,
        event_tool_name: Option<&str>,
        mut attributes: Attributes,
        status: SpanStatus,
        message: Option<String>,
        error_type: Option<&str>,
    ) {
        let Some(mut frame) = tree.pop_tool() else {
            debug!(
                session_id = tree.session_id(),
                tool = event_tool_name.unwrap_or(UNKNOWN),
                "tool end with empty tool stack ignored"
            );
            return;
        };

        if let Some(expected) = event_tool_name.filter(|name| *name != frame.tool_name) {
            warn!(
                session_id = tree.session_id(),
                expected,
                actual = %frame.tool_name,
                "tool end does not match innermost tool; closing innermost"
            );
            frame.span.set_attribute(keys::TOOL_EXPECTED_NAME, expected);
        }

        // The span keeps the name it was opened with.
        attributes.remove(keys::TOOL_NAME);
        frame.span.extend_attributes(attributes);
        let finished = frame.span.end(status, message);

        self.record_metric(&CompletedOperation::ToolCall {
            tool_name: &frame.tool_name,
            duration_secs: finished.duration_secs(),
            error_type,
        });
        self.submit(finished);
    }

    fn finish_llm_response(
        &self,
        tree: &mut SessionSpanTree,
        response: &LlmResponse,
        attributes: Attributes,
    ) {
        let Some(mut span) = tree.take_llm() else {
            debug!(session_id = tree.session_id(), "llm:response without open call ignored");
            return;
        };
        let (provider, model) = llm_identity(&span, response.provider.as_deref(), response.model.as_deref());
        span.extend_attributes(attributes);
        let finished = span.end(SpanStatus::Ok, None);

        self.record_metric(&CompletedOperation::LlmCall {
            provider: &provider,
            model: &model,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            duration_secs: finished.duration_secs(),
            error_type: None,
        });
        self.submit(finished);
    }

    fn finish_llm_error(&self, tree: &mut SessionSpanTree, error: &ProviderError, attributes: Attributes) {
        let Some(mut span) = tree.take_llm() else {
            debug!(session_id = tree.session_id(), "provider:error without open call ignored");
            return;
        };
        let (provider, model) = llm_identity(&span, error.provider.as_deref(), error.model.as_deref());
        let message = error.error.as_ref().and_then(|e| self.mapper.error_description(e));
        let error_type = error
            .error
            .as_ref()
            .map_or_else(|| ErrorInfo::OTHER.to_string(), |e| e.error_type.clone());
        span.extend_attributes(attributes);
        let finished = span.end(SpanStatus::Error, message);

        self.record_metric(&CompletedOperation::LlmCall {
            provider: &provider,
            model: &model,
            input_tokens: None,
            output_tokens: None,
            duration_secs: finished.duration_secs(),
            error_type: Some(&error_type),
        });
        self.submit(finished);
    }

    fn begin_paired(&self, tree: &mut SessionSpanTree, operation: PairedOperation, attributes: Attributes) {
        let span = tree.start_child(operation.span_name(), SpanKind::Internal, attributes);
        if let Some(previous) = tree.begin_paired(operation, span) {
            warn!(
                session_id = tree.session_id(),
                operation = operation.span_name(),
                "operation restarted before it ended; closing previous span"
            );
            self.submit(previous);
        }
    }

    fn end_paired(&self, tree: &mut SessionSpanTree, operation: PairedOperation, attributes: Attributes) {
        let Some(mut span) = tree.take_paired(operation) else {
            debug!(
                session_id = tree.session_id(),
                operation = operation.span_name(),
                "end of operation that was never started ignored"
            );
            return;
        };
        span.extend_attributes(attributes);
        self.submit(span.end(SpanStatus::Ok, None));
    }

    fn instant(
        &self,
        tree: &SessionSpanTree,
        name: &str,
        attributes: Attributes,
        status: SpanStatus,
        message: Option<String>,
    ) {
        let span = tree.start_child(name, SpanKind::Internal, attributes);
        let at = span.start_time();
        self.submit(span.end_at(at, status, message));
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn with_tree<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionSpanTree) -> R) -> Option<R> {
        let slot = self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))?;
        let mut guard = slot.lock();
        guard.as_mut().map(f)
    }

    fn submit(&self, span: FinishedSpan) {
        if !self.export_traces || !span.sampled {
            return;
        }
        if let Err(e) = self.export.submit_span(span) {
            trace!(error = %e, "span dropped at handoff");
        }
    }
}

/// Provider and model for metrics: from the closing event when present,
/// else from what the request recorded on the span.
fn llm_identity(span: &Span, provider: Option<&str>, model: Option<&str>) -> (String, String) {
    let recorded = |key: &str| {
        span.attributes()
            .get(key)
            .and_then(AttributeValue::as_str)
            .map(str::to_string)
    };
    let provider = provider
        .map(str::to_string)
        .or_else(|| recorded(keys::GEN_AI_SYSTEM))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let model = model
        .map(str::to_string)
        .or_else(|| recorded(keys::GEN_AI_REQUEST_MODEL))
        .unwrap_or_else(|| UNKNOWN.to_string());
    (provider, model)
}
