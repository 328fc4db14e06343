//! Attribute mapping: kernel payloads to semantic-convention attributes.
//!
//! [`AttributeMapper::map`] is pure. It runs four stages in a fixed order:
//!
//! 1. semantic-convention naming (`provider` → `gen_ai.system`, ...)
//! 2. redaction of sensitive payload classes
//! 3. path sanitization of source-like values
//! 4. length limits (payload limits for content, `max_attribute_length` for
//!    everything else)
//!
//! Redaction runs before truncation so a redacted value never carries size
//! metadata about the content it replaced. Sources are classified before
//! they are cut, so a truncated URL is still reported as a URL.

use crate::config::{
    OtelConfig, PayloadLimitsConfig, PayloadType, SensitiveDataConfig, SensitiveKind,
    FILTERED_PLACEHOLDER,
};
use crate::event::{ErrorInfo, EventPayload};
use crate::span::{AttributeValue, Attributes};
use serde_json::Value;

/// Attribute keys used across spans and metrics.
pub mod keys {
    pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";
    pub const GEN_AI_SYSTEM: &str = "gen_ai.system";
    pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
    pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
    pub const GEN_AI_RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";
    pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const GEN_AI_INPUT_MESSAGES: &str = "gen_ai.input.messages";
    pub const GEN_AI_OUTPUT_MESSAGES: &str = "gen_ai.output.messages";
    pub const GEN_AI_TOOL_CALL_ID: &str = "gen_ai.tool.call.id";
    pub const GEN_AI_TOKEN_TYPE: &str = "gen_ai.token.type";
    pub const ERROR_TYPE: &str = "error.type";

    pub const SESSION_ID: &str = "amplifier.session.id";
    pub const SESSION_PARENT_ID: &str = "amplifier.session.parent_id";
    pub const SESSION_TYPE: &str = "amplifier.session.type";
    pub const SESSION_STATUS: &str = "amplifier.session.status";
    pub const SESSION_TURNS: &str = "amplifier.session.turns";
    pub const SESSION_CANCELLED: &str = "amplifier.session.cancelled";
    pub const USER_ID: &str = "amplifier.user.id";
    pub const TEAM_ID: &str = "amplifier.team.id";
    pub const ORCHESTRATOR_COMPLETED: &str = "amplifier.orchestrator.completed";

    pub const TURN_NUMBER: &str = "amplifier.turn.number";
    pub const TURN_SUPERSEDED: &str = "amplifier.turn.superseded";

    pub const TOOL_NAME: &str = "amplifier.tool.name";
    pub const TOOL_SUCCESS: &str = "amplifier.tool.success";
    pub const TOOL_INPUT: &str = "amplifier.tool.input";
    pub const TOOL_HAS_INPUT: &str = "amplifier.tool.has_input";
    pub const TOOL_RESULT: &str = "amplifier.tool.result";
    pub const TOOL_HAS_RESULT: &str = "amplifier.tool.has_result";
    pub const TOOL_EXPECTED_NAME: &str = "amplifier.tool.expected_name";

    pub const LLM_SUCCESS: &str = "amplifier.llm.success";

    pub const PROMPT_CONTENT: &str = "amplifier.prompt.content";
    pub const PROMPT_LENGTH: &str = "amplifier.prompt.length";
    pub const PLAN_STEP_COUNT: &str = "amplifier.plan.step_count";

    pub const CONTEXT_TOKENS_BEFORE: &str = "amplifier.context.tokens_before";
    pub const CONTEXT_TOKENS_AFTER: &str = "amplifier.context.tokens_after";
    pub const CONTEXT_MESSAGES_REMOVED: &str = "amplifier.context.messages_removed";
    pub const CONTEXT_SOURCE: &str = "amplifier.context.source";

    pub const APPROVAL_ACTION: &str = "amplifier.approval.action";
    pub const APPROVAL_PROMPT: &str = "amplifier.approval.prompt";
    pub const APPROVAL_RESULT: &str = "amplifier.approval.result";
    pub const APPROVAL_DENIAL_REASON: &str = "amplifier.approval.denial_reason";

    pub const CANCEL_REASON: &str = "amplifier.cancel.reason";
    pub const CANCEL_IMMEDIATE: &str = "amplifier.cancel.immediate";

    pub const ARTIFACT_PATH: &str = "amplifier.artifact.path";
    pub const ARTIFACT_SIZE_BYTES: &str = "amplifier.artifact.size_bytes";

    pub const POLICY_VIOLATION_TYPE: &str = "amplifier.policy.violation_type";
    pub const POLICY_NAME: &str = "amplifier.policy.name";

    pub const BUNDLE_NAME: &str = "amplifier.bundle.name";
    pub const BUNDLE_OPERATION: &str = "amplifier.bundle.operation";
    pub const BUNDLE_VERSION: &str = "amplifier.bundle.version";
    pub const BUNDLE_SOURCE: &str = "amplifier.bundle.source";
    pub const BUNDLE_CACHED: &str = "amplifier.bundle.cached";

    pub const SERVICE_NAME: &str = "service.name";
    pub const SERVICE_VERSION: &str = "service.version";
}

const TRUNCATED_SUFFIX: &str = "...[truncated]";
const LOCAL_SOURCE: &str = "local";
const UNKNOWN_SOURCE: &str = "unknown";
const URL_PREFIXES: &[&str] = &["git+https://", "https://", "http://", "git+ssh://", "ssh://", "git@"];

/// Immutable filtering inputs for [`AttributeMapper`].
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub sensitive: SensitiveDataConfig,
    pub payload_limits: PayloadLimitsConfig,
    pub max_attribute_length: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::from_config(&OtelConfig::default())
    }
}

impl FilterConfig {
    pub fn from_config(config: &OtelConfig) -> Self {
        Self {
            sensitive: config.sensitive_data.clone(),
            payload_limits: config.payload_limits.clone(),
            max_attribute_length: config.max_attribute_length,
        }
    }
}

/// Size bookkeeping for a payload that exceeded its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMetadata {
    pub original_size: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldClass {
    Metadata,
    Sensitive(SensitiveKind, PayloadType),
    Source,
}

#[derive(Debug)]
struct Field {
    key: String,
    value: AttributeValue,
    class: FieldClass,
    redacted: bool,
}

impl Field {
    fn metadata(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            class: FieldClass::Metadata,
            redacted: false,
        }
    }

    fn sensitive(key: &str, value: String, kind: SensitiveKind, ty: PayloadType) -> Self {
        Self {
            key: key.to_string(),
            value: AttributeValue::String(value),
            class: FieldClass::Sensitive(kind, ty),
            redacted: false,
        }
    }

    fn source(key: &str, value: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            value: AttributeValue::String(value.unwrap_or(UNKNOWN_SOURCE).to_string()),
            class: FieldClass::Source,
            redacted: false,
        }
    }
}

/// Maps typed event payloads to span attributes.
#[derive(Debug, Clone, Default)]
pub struct AttributeMapper {
    filter: FilterConfig,
}

impl AttributeMapper {
    pub fn new(filter: FilterConfig) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    /// Maps one payload to its attribute set.
    pub fn map(&self, payload: &EventPayload) -> Attributes {
        let mut fields = semantic_fields(payload);
        self.redact(&mut fields);
        sanitize_sources(&mut fields);
        self.limit(&mut fields);
        fields.into_iter().map(|f| (f.key, f.value)).collect()
    }

    /// Status description for an error, respecting the error-message filter.
    pub fn error_description(&self, error: &ErrorInfo) -> Option<String> {
        let message = error.message.as_deref()?;
        if self.filter.sensitive.should_filter(SensitiveKind::ErrorMessages) {
            return Some(FILTERED_PLACEHOLDER.to_string());
        }
        Some(self.limit_payload(message, PayloadType::Error).0)
    }

    /// Applies the payload limit for `payload_type`.
    ///
    /// Oversized values are either replaced by a `[PAYLOAD_DROPPED: ...]`
    /// placeholder or cut to the limit with a `[TRUNCATED: ...]` suffix.
    pub fn limit_payload(
        &self,
        content: &str,
        payload_type: PayloadType,
    ) -> (String, Option<PayloadMetadata>) {
        let limits = &self.filter.payload_limits;
        let limit = limits.limit_for(payload_type);
        let size = content.len();
        if size <= limit {
            return (content.to_string(), None);
        }

        let processed = if limits.drop_large_payloads {
            format!("[PAYLOAD_DROPPED: size={size}, limit={limit}]")
        } else {
            format!(
                "{}...[TRUNCATED: size={size}, limit={limit}]",
                prefix_within(content, limit)
            )
        };
        let metadata = limits.include_size_metadata.then_some(PayloadMetadata {
            original_size: size,
            limit,
        });
        (processed, metadata)
    }

    fn redact(&self, fields: &mut [Field]) {
        for field in fields {
            if let FieldClass::Sensitive(kind, _) = field.class {
                if self.filter.sensitive.should_filter(kind) {
                    field.value = AttributeValue::String(FILTERED_PLACEHOLDER.to_string());
                    field.redacted = true;
                }
            }
        }
    }

    fn limit(&self, fields: &mut Vec<Field>) {
        let mut size_metadata = Vec::new();
        for field in fields.iter_mut() {
            let AttributeValue::String(value) = &field.value else {
                continue;
            };
            let limited = match field.class {
                FieldClass::Sensitive(_, ty) if !field.redacted => {
                    let (processed, metadata) = self.limit_payload(value, ty);
                    if let Some(meta) = metadata {
                        size_metadata.push(Field::metadata(
                            format!("{}.original_size", field.key),
                            meta.original_size as u64,
                        ));
                        size_metadata
                            .push(Field::metadata(format!("{}.limit", field.key), meta.limit as u64));
                        size_metadata.push(Field::metadata(format!("{}.truncated", field.key), true));
                    }
                    processed
                }
                _ => truncate_attribute(value, self.filter.max_attribute_length),
            };
            field.value = AttributeValue::String(limited);
        }
        fields.extend(size_metadata);
    }
}

/// Stage 1: payload fields under their semantic-convention names.
fn semantic_fields(payload: &EventPayload) -> Vec<Field> {
    use keys::*;
    use SensitiveKind as S;

    fn opt(out: &mut Vec<Field>, key: &'static str, value: Option<AttributeValue>) {
        if let Some(v) = value {
            out.push(Field::metadata(key, v));
        }
    }

    let mut out = Vec::new();

    match payload {
        EventPayload::SessionStart(start) => {
            opt(&mut out, USER_ID, start.user_id.clone().map(Into::into));
            opt(&mut out, SESSION_PARENT_ID, start.parent_id.clone().map(Into::into));
            opt(&mut out, BUNDLE_NAME, start.bundle.clone().map(Into::into));
        }
        EventPayload::SessionFork(fork) => {
            opt(&mut out, USER_ID, fork.user_id.clone().map(Into::into));
            opt(&mut out, SESSION_PARENT_ID, fork.parent_id.clone().map(Into::into));
        }
        EventPayload::SessionResume(resume) => {
            opt(&mut out, USER_ID, resume.user_id.clone().map(Into::into));
        }
        EventPayload::SessionEnd(end) => {
            opt(&mut out, SESSION_STATUS, end.outcome.map(|o| o.as_str().into()));
            opt(
                &mut out,
                ERROR_TYPE,
                end.error.as_ref().map(|e| e.error_type.clone().into()),
            );
        }
        EventPayload::LlmRequest(request) => {
            out.push(Field::metadata(GEN_AI_OPERATION_NAME, "chat"));
            opt(&mut out, GEN_AI_SYSTEM, request.provider.clone().map(Into::into));
            opt(&mut out, GEN_AI_REQUEST_MODEL, request.model.clone().map(Into::into));
            opt(&mut out, GEN_AI_REQUEST_TEMPERATURE, request.temperature.map(Into::into));
            opt(&mut out, GEN_AI_REQUEST_MAX_TOKENS, request.max_tokens.map(Into::into));
            if let Some(messages) = &request.messages {
                out.push(Field::sensitive(
                    GEN_AI_INPUT_MESSAGES,
                    json_text(messages),
                    S::LlmContent,
                    PayloadType::LlmContent,
                ));
            }
        }
        EventPayload::LlmResponse(response) => {
            opt(&mut out, GEN_AI_SYSTEM, response.provider.clone().map(Into::into));
            opt(&mut out, GEN_AI_REQUEST_MODEL, response.model.clone().map(Into::into));
            opt(
                &mut out,
                GEN_AI_RESPONSE_MODEL,
                response.response_model.clone().map(Into::into),
            );
            opt(&mut out, GEN_AI_USAGE_INPUT_TOKENS, response.input_tokens.map(Into::into));
            opt(&mut out, GEN_AI_USAGE_OUTPUT_TOKENS, response.output_tokens.map(Into::into));
            opt(
                &mut out,
                GEN_AI_RESPONSE_FINISH_REASONS,
                response.finish_reason.clone().map(|r| vec![r].into()),
            );
            if let Some(content) = &response.content {
                out.push(Field::sensitive(
                    GEN_AI_OUTPUT_MESSAGES,
                    json_text(content),
                    S::LlmContent,
                    PayloadType::LlmContent,
                ));
            }
        }
        EventPayload::ProviderError(error) => {
            opt(&mut out, GEN_AI_SYSTEM, error.provider.clone().map(Into::into));
            opt(&mut out, GEN_AI_REQUEST_MODEL, error.model.clone().map(Into::into));
            out.push(Field::metadata(ERROR_TYPE, error_type(error.error.as_ref())));
        }
        EventPayload::ToolPre(pre) => {
            out.push(Field::metadata(GEN_AI_OPERATION_NAME, "execute_tool"));
            opt(&mut out, TOOL_NAME, pre.tool_name.clone().map(Into::into));
            opt(&mut out, GEN_AI_TOOL_CALL_ID, pre.tool_call_id.clone().map(Into::into));
            out.push(Field::metadata(TOOL_HAS_INPUT, pre.tool_input.is_some()));
            if let Some(input) = &pre.tool_input {
                out.push(Field::sensitive(
                    TOOL_INPUT,
                    json_text(input),
                    S::ToolParameters,
                    PayloadType::ToolPayload,
                ));
            }
        }
        EventPayload::ToolPost(post) => {
            opt(&mut out, TOOL_NAME, post.tool_name.clone().map(Into::into));
            out.push(Field::metadata(TOOL_SUCCESS, post.success));
            out.push(Field::metadata(TOOL_HAS_RESULT, post.result.is_some()));
            if let Some(result) = &post.result {
                out.push(Field::sensitive(
                    TOOL_RESULT,
                    json_text(result),
                    S::ToolResults,
                    PayloadType::ToolPayload,
                ));
            }
        }
        EventPayload::ToolError(error) => {
            opt(&mut out, TOOL_NAME, error.tool_name.clone().map(Into::into));
            out.push(Field::metadata(TOOL_SUCCESS, false));
            out.push(Field::metadata(ERROR_TYPE, error_type(error.error.as_ref())));
        }
        EventPayload::PromptSubmit(submit) => {
            if let Some(prompt) = &submit.prompt {
                out.push(Field::metadata(PROMPT_LENGTH, prompt.chars().count() as u64));
                out.push(Field::sensitive(
                    PROMPT_CONTENT,
                    prompt.clone(),
                    S::UserInput,
                    PayloadType::Default,
                ));
            }
        }
        EventPayload::PlanStart(plan) => {
            opt(&mut out, PLAN_STEP_COUNT, plan.step_count.map(Into::into));
        }
        EventPayload::ContextCompaction(compaction) => {
            opt(&mut out, CONTEXT_TOKENS_BEFORE, compaction.tokens_before.map(Into::into));
            opt(&mut out, CONTEXT_TOKENS_AFTER, compaction.tokens_after.map(Into::into));
            opt(
                &mut out,
                CONTEXT_MESSAGES_REMOVED,
                compaction.messages_removed.map(Into::into),
            );
        }
        EventPayload::ContextInclude(include) => {
            out.push(Field::source(CONTEXT_SOURCE, include.source.as_deref()));
        }
        EventPayload::ApprovalRequired(approval) => {
            opt(&mut out, APPROVAL_ACTION, approval.action.clone().map(Into::into));
            if let Some(prompt) = &approval.prompt {
                out.push(Field::sensitive(
                    APPROVAL_PROMPT,
                    prompt.clone(),
                    S::ToolParameters,
                    PayloadType::ToolPayload,
                ));
            }
        }
        EventPayload::ApprovalGranted => {
            out.push(Field::metadata(APPROVAL_RESULT, "granted"));
        }
        EventPayload::ApprovalDenied(denied) => {
            out.push(Field::metadata(APPROVAL_RESULT, "denied"));
            if let Some(reason) = denied.reason.as_ref().filter(|r| !r.is_empty()) {
                out.push(Field::sensitive(
                    APPROVAL_DENIAL_REASON,
                    reason.clone(),
                    S::UserInput,
                    PayloadType::Default,
                ));
            }
        }
        EventPayload::CancelRequested(cancel) => {
            opt(&mut out, CANCEL_IMMEDIATE, cancel.immediate.map(Into::into));
            if let Some(reason) = &cancel.reason {
                out.push(Field::sensitive(
                    CANCEL_REASON,
                    reason.clone(),
                    S::UserInput,
                    PayloadType::Default,
                ));
            }
        }
        EventPayload::ArtifactRead(artifact) | EventPayload::ArtifactWrite(artifact) => {
            if artifact.path.is_some() {
                out.push(Field::source(ARTIFACT_PATH, artifact.path.as_deref()));
            }
            opt(&mut out, ARTIFACT_SIZE_BYTES, artifact.size_bytes.map(Into::into));
        }
        EventPayload::PolicyViolation(violation) => {
            out.push(Field::metadata(
                POLICY_VIOLATION_TYPE,
                violation.violation_type.clone(),
            ));
            opt(&mut out, POLICY_NAME, violation.policy.clone().map(Into::into));
        }
        EventPayload::ExecutionStart
        | EventPayload::ExecutionEnd
        | EventPayload::OrchestratorComplete
        | EventPayload::PromptComplete
        | EventPayload::PlanEnd
        | EventPayload::CancelCompleted => {}
    }
    out
}

/// Stage 4: source-like values that are local paths become `"local"`.
fn sanitize_sources(fields: &mut [Field]) {
    for field in fields.iter_mut().filter(|f| f.class == FieldClass::Source) {
        if let AttributeValue::String(value) = &field.value {
            field.value = AttributeValue::String(sanitize_source(Some(value)));
        }
    }
}

/// Privacy-preserving form of a bundle or context source.
///
/// URL-form sources (`git+https://`, `https://`, `git@`, `ssh://`, ...) are
/// kept verbatim; anything else is treated as a local path and reported as
/// `"local"`. A missing source is `"unknown"`.
pub fn sanitize_source(source: Option<&str>) -> String {
    match source.map(str::trim) {
        None | Some("") => UNKNOWN_SOURCE.to_string(),
        Some(UNKNOWN_SOURCE) => UNKNOWN_SOURCE.to_string(),
        Some(s) if URL_PREFIXES.iter().any(|p| s.starts_with(p)) => s.to_string(),
        Some(_) => LOCAL_SOURCE.to_string(),
    }
}

fn error_type(error: Option<&ErrorInfo>) -> String {
    error.map_or_else(|| ErrorInfo::OTHER.to_string(), |e| e.error_type.clone())
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_attribute(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    format!("{}{}", prefix_within(value, max), TRUNCATED_SUFFIX)
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary.
fn prefix_within(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
