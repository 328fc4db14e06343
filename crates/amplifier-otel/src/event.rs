//! Typed kernel events.
//!
//! The kernel emits `(name, JSON payload)` pairs. Each subscribed name maps to
//! one [`EventCategory`] and decodes into one [`EventPayload`] variant with
//! explicit fields. Decoding is lenient: a missing or wrongly typed field
//! becomes `None` (or its documented default) and only the attribute that
//! depends on it is omitted.

use crate::error::EventError;
use serde_json::Value;
use std::fmt;

/// Dispatcher priority for handlers that open spans. Runs before other
/// consumers can mutate the payload.
pub const PRIORITY_START: i32 = 5;
/// Dispatcher priority for handlers that record zero-duration spans.
pub const PRIORITY_INSTANT: i32 = 50;
/// Dispatcher priority for handlers that close spans. Runs after every
/// other consumer has seen the payload.
pub const PRIORITY_END: i32 = 95;

/// Where an event sits in a span's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Start,
    Instant,
    End,
}

impl EventPhase {
    pub fn priority(self) -> i32 {
        match self {
            Self::Start => PRIORITY_START,
            Self::Instant => PRIORITY_INSTANT,
            Self::End => PRIORITY_END,
        }
    }
}

macro_rules! event_categories {
    ($($variant:ident => $name:literal, $phase:ident;)+) => {
        /// Every kernel event the hook subscribes to.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventCategory {
            $($variant,)+
        }

        impl EventCategory {
            pub const ALL: &'static [EventCategory] = &[$(Self::$variant,)+];

            /// Kernel event name, e.g. `tool:pre`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            pub fn phase(self) -> EventPhase {
                match self {
                    $(Self::$variant => EventPhase::$phase,)+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

event_categories! {
    SessionStart => "session:start", Start;
    SessionFork => "session:fork", Start;
    SessionResume => "session:resume", Start;
    SessionEnd => "session:end", End;
    ExecutionStart => "execution:start", Start;
    ExecutionEnd => "execution:end", End;
    OrchestratorComplete => "orchestrator:complete", End;
    LlmRequest => "llm:request", Start;
    LlmResponse => "llm:response", End;
    ProviderError => "provider:error", End;
    ToolPre => "tool:pre", Start;
    ToolPost => "tool:post", End;
    ToolError => "tool:error", End;
    PromptSubmit => "prompt:submit", Start;
    PromptComplete => "prompt:complete", End;
    PlanStart => "plan:start", Start;
    PlanEnd => "plan:end", End;
    ContextCompaction => "context:compaction", Instant;
    ContextInclude => "context:include", Instant;
    ApprovalRequired => "approval:required", Start;
    ApprovalGranted => "approval:granted", End;
    ApprovalDenied => "approval:denied", End;
    CancelRequested => "cancel:requested", Start;
    CancelCompleted => "cancel:completed", End;
    ArtifactRead => "artifact:read", Instant;
    ArtifactWrite => "artifact:write", Instant;
    PolicyViolation => "policy:violation", Instant;
}

impl EventCategory {
    pub fn priority(self) -> i32 {
        self.phase().priority()
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome carried by `session:end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Error,
}

impl SessionOutcome {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "ok" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "error" | "failed" | "failure" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Error detail attached to `tool:error`, `provider:error` and `session:end`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorInfo {
    /// Error class; `_OTHER` when the payload did not say.
    pub error_type: String,
    pub message: Option<String>,
}

impl ErrorInfo {
    pub const OTHER: &'static str = "_OTHER";

    fn from_value(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::Null => None,
            Value::Object(map) => Some(Self {
                error_type: map
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(Self::OTHER)
                    .to_string(),
                message: map.get("message").and_then(Value::as_str).map(str::to_string),
            }),
            Value::String(message) => Some(Self {
                error_type: Self::OTHER.to_string(),
                message: Some(message.clone()),
            }),
            other => Some(Self {
                error_type: Self::OTHER.to_string(),
                message: Some(other.to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStart {
    /// Parent session, when the kernel reports the link on start.
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
    pub bundle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFork {
    pub parent_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionResume {
    /// Persisted W3C `traceparent` of the original session root.
    pub traceparent: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionEnd {
    /// `None` when the payload had no recognizable status.
    pub outcome: Option<SessionOutcome>,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmRequest {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub messages: Option<Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub response_model: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub finish_reason: Option<String>,
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderError {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPre {
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_input: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPost {
    pub tool_name: Option<String>,
    pub result: Option<Value>,
    /// Defaults to `true` when absent.
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolError {
    pub tool_name: Option<String>,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptSubmit {
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanStart {
    pub step_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextCompaction {
    pub tokens_before: Option<u64>,
    pub tokens_after: Option<u64>,
    pub messages_removed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextInclude {
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalRequired {
    pub action: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalDenied {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelRequested {
    pub reason: Option<String>,
    pub immediate: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    pub path: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyViolation {
    /// Defaults to `"policy violation"` when absent.
    pub violation_type: String,
    pub policy: Option<String>,
}

/// Decoded payload of one kernel event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SessionStart(SessionStart),
    SessionFork(SessionFork),
    SessionResume(SessionResume),
    SessionEnd(SessionEnd),
    ExecutionStart,
    ExecutionEnd,
    OrchestratorComplete,
    LlmRequest(LlmRequest),
    LlmResponse(LlmResponse),
    ProviderError(ProviderError),
    ToolPre(ToolPre),
    ToolPost(ToolPost),
    ToolError(ToolError),
    PromptSubmit(PromptSubmit),
    PromptComplete,
    PlanStart(PlanStart),
    PlanEnd,
    ContextCompaction(ContextCompaction),
    ContextInclude(ContextInclude),
    ApprovalRequired(ApprovalRequired),
    ApprovalGranted,
    ApprovalDenied(ApprovalDenied),
    CancelRequested(CancelRequested),
    CancelCompleted,
    ArtifactRead(Artifact),
    ArtifactWrite(Artifact),
    PolicyViolation(PolicyViolation),
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::SessionStart(_) => EventCategory::SessionStart,
            Self::SessionFork(_) => EventCategory::SessionFork,
            Self::SessionResume(_) => EventCategory::SessionResume,
            Self::SessionEnd(_) => EventCategory::SessionEnd,
            Self::ExecutionStart => EventCategory::ExecutionStart,
            Self::ExecutionEnd => EventCategory::ExecutionEnd,
            Self::OrchestratorComplete => EventCategory::OrchestratorComplete,
            Self::LlmRequest(_) => EventCategory::LlmRequest,
            Self::LlmResponse(_) => EventCategory::LlmResponse,
            Self::ProviderError(_) => EventCategory::ProviderError,
            Self::ToolPre(_) => EventCategory::ToolPre,
            Self::ToolPost(_) => EventCategory::ToolPost,
            Self::ToolError(_) => EventCategory::ToolError,
            Self::PromptSubmit(_) => EventCategory::PromptSubmit,
            Self::PromptComplete => EventCategory::PromptComplete,
            Self::PlanStart(_) => EventCategory::PlanStart,
            Self::PlanEnd => EventCategory::PlanEnd,
            Self::ContextCompaction(_) => EventCategory::ContextCompaction,
            Self::ContextInclude(_) => EventCategory::ContextInclude,
            Self::ApprovalRequired(_) => EventCategory::ApprovalRequired,
            Self::ApprovalGranted => EventCategory::ApprovalGranted,
            Self::ApprovalDenied(_) => EventCategory::ApprovalDenied,
            Self::CancelRequested(_) => EventCategory::CancelRequested,
            Self::CancelCompleted => EventCategory::CancelCompleted,
            Self::ArtifactRead(_) => EventCategory::ArtifactRead,
            Self::ArtifactWrite(_) => EventCategory::ArtifactWrite,
            Self::PolicyViolation(_) => EventCategory::PolicyViolation,
        }
    }

    /// Decodes `data` as the payload of `category`.
    pub fn decode(category: EventCategory, data: &Value) -> Self {
        let f = Fields(data);
        match category {
            EventCategory::SessionStart => Self::SessionStart(SessionStart {
                parent_id: f.string("parent").or_else(|| f.string("parent_id")),
                user_id: f.string("user_id"),
                bundle: f.string("bundle"),
            }),
            EventCategory::SessionFork => Self::SessionFork(SessionFork {
                parent_id: f.string("parent").or_else(|| f.string("parent_id")),
                user_id: f.string("user_id"),
            }),
            EventCategory::SessionResume => Self::SessionResume(SessionResume {
                traceparent: f.string("traceparent"),
                user_id: f.string("user_id"),
            }),
            EventCategory::SessionEnd => Self::SessionEnd(SessionEnd {
                outcome: f.string("status").as_deref().and_then(SessionOutcome::parse),
                error: ErrorInfo::from_value(f.get("error")),
            }),
            EventCategory::ExecutionStart => Self::ExecutionStart,
            EventCategory::ExecutionEnd => Self::ExecutionEnd,
            EventCategory::OrchestratorComplete => Self::OrchestratorComplete,
            EventCategory::LlmRequest => Self::LlmRequest(LlmRequest {
                provider: f.string("provider"),
                model: f.string("model"),
                messages: f.value("messages").or_else(|| f.value("prompt")),
                temperature: f.float("temperature"),
                max_tokens: f.uint("max_tokens"),
            }),
            EventCategory::LlmResponse => {
                let usage = Fields(f.get("usage").unwrap_or(&Value::Null));
                Self::LlmResponse(LlmResponse {
                    provider: f.string("provider"),
                    model: f.string("model"),
                    response_model: f.string("response_model"),
                    input_tokens: usage.uint("input_tokens").or_else(|| f.uint("input_tokens")),
                    output_tokens: usage
                        .uint("output_tokens")
                        .or_else(|| f.uint("output_tokens")),
                    finish_reason: f
                        .string("finish_reason")
                        .or_else(|| f.string("stop_reason")),
                    content: f.value("content").or_else(|| f.value("response")),
                })
            }
            EventCategory::ProviderError => Self::ProviderError(ProviderError {
                provider: f.string("provider"),
                model: f.string("model"),
                error: ErrorInfo::from_value(f.get("error")),
            }),
            EventCategory::ToolPre => Self::ToolPre(ToolPre {
                tool_name: f.string("tool_name"),
                tool_call_id: f.string("tool_call_id"),
                tool_input: f.value("tool_input"),
            }),
            EventCategory::ToolPost => Self::ToolPost(ToolPost {
                tool_name: f.string("tool_name"),
                result: f.value("result").or_else(|| f.value("tool_response")),
                success: f.boolean("success").unwrap_or(true),
            }),
            EventCategory::ToolError => Self::ToolError(ToolError {
                tool_name: f.string("tool_name"),
                error: ErrorInfo::from_value(f.get("error")),
            }),
            EventCategory::PromptSubmit => Self::PromptSubmit(PromptSubmit {
                prompt: f.string("prompt"),
            }),
            EventCategory::PromptComplete => Self::PromptComplete,
            EventCategory::PlanStart => Self::PlanStart(PlanStart {
                step_count: f
                    .get("steps")
                    .and_then(Value::as_array)
                    .map(|steps| steps.len() as u64)
                    .or_else(|| f.uint("step_count")),
            }),
            EventCategory::PlanEnd => Self::PlanEnd,
            EventCategory::ContextCompaction => Self::ContextCompaction(ContextCompaction {
                tokens_before: f.uint("tokens_before"),
                tokens_after: f.uint("tokens_after"),
                messages_removed: f.uint("messages_removed"),
            }),
            EventCategory::ContextInclude => Self::ContextInclude(ContextInclude {
                source: f.string("source").or_else(|| f.string("path")),
            }),
            EventCategory::ApprovalRequired => Self::ApprovalRequired(ApprovalRequired {
                action: f.string("action").or_else(|| f.string("tool_name")),
                prompt: f.string("prompt"),
            }),
            EventCategory::ApprovalGranted => Self::ApprovalGranted,
            EventCategory::ApprovalDenied => Self::ApprovalDenied(ApprovalDenied {
                reason: f.string("reason"),
            }),
            EventCategory::CancelRequested => Self::CancelRequested(CancelRequested {
                reason: f.string("reason"),
                immediate: f.boolean("immediate"),
            }),
            EventCategory::CancelCompleted => Self::CancelCompleted,
            EventCategory::ArtifactRead => Self::ArtifactRead(Artifact::decode(&f)),
            EventCategory::ArtifactWrite => Self::ArtifactWrite(Artifact::decode(&f)),
            EventCategory::PolicyViolation => Self::PolicyViolation(PolicyViolation {
                violation_type: f
                    .string("violation_type")
                    .unwrap_or_else(|| "policy violation".to_string()),
                policy: f.string("policy"),
            }),
        }
    }
}

impl Artifact {
    fn decode(f: &Fields<'_>) -> Self {
        Self {
            path: f.string("path"),
            size_bytes: f.uint("size_bytes").or_else(|| f.uint("bytes")),
        }
    }
}

/// One kernel event addressed to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelEvent {
    pub session_id: String,
    pub payload: EventPayload,
}

impl KernelEvent {
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            payload,
        }
    }

    /// Decodes a raw `(name, data)` pair as emitted by the kernel.
    pub fn from_raw(name: &str, data: &Value) -> Result<Self, EventError> {
        let category =
            EventCategory::from_name(name).ok_or_else(|| EventError::UnknownEvent(name.to_string()))?;
        let session_id = Fields(data)
            .string("session_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EventError::MissingSessionId {
                event: name.to_string(),
            })?;
        Ok(Self {
            session_id,
            payload: EventPayload::decode(category, data),
        })
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }
}

/// Lenient accessors over a JSON payload object.
struct Fields<'a>(&'a Value);

impl<'a> Fields<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_names_round_trip() {
        for category in EventCategory::ALL {
            assert_eq!(EventCategory::from_name(category.name()), Some(*category));
        }
        assert_eq!(EventCategory::ALL.len(), 27);
        assert_eq!(EventCategory::from_name("tool:unknown"), None);
    }

    #[test]
    fn test_priorities() {
        assert_eq!(EventCategory::SessionStart.priority(), 5);
        assert_eq!(EventCategory::ToolPre.priority(), 5);
        assert_eq!(EventCategory::ToolPost.priority(), 95);
        assert_eq!(EventCategory::SessionEnd.priority(), 95);
        assert_eq!(EventCategory::ContextCompaction.priority(), 50);
        assert_eq!(EventCategory::PolicyViolation.priority(), 50);
    }

    #[test]
    fn test_from_raw_requires_session_id() {
        assert_eq!(
            KernelEvent::from_raw("tool:pre", &json!({"tool_name": "bash"})),
            Err(EventError::MissingSessionId {
                event: "tool:pre".to_string()
            })
        );
        assert!(KernelEvent::from_raw("nope", &json!({"session_id": "s"}))
            .unwrap_err()
            .is_unknown_event());
    }

    #[test]
    fn test_llm_response_usage() {
        let event = KernelEvent::from_raw(
            "llm:response",
            &json!({
                "session_id": "s",
                "provider": "anthropic",
                "model": "m",
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "finish_reason": "end_turn"
            }),
        )
        .unwrap();

        let EventPayload::LlmResponse(response) = event.payload else {
            panic!("wrong variant");
        };
        assert_eq!(response.input_tokens, Some(10));
        assert_eq!(response.output_tokens, Some(5));
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_wrongly_typed_fields_become_none() {
        let event = KernelEvent::from_raw(
            "tool:post",
            &json!({"session_id": "s", "tool_name": 42, "success": "yes"}),
        )
        .unwrap();
        let EventPayload::ToolPost(post) = event.payload else {
            panic!("wrong variant");
        };
        assert_eq!(post.tool_name, None);
        assert!(post.success);
    }

    #[test]
    fn test_error_info_shapes() {
        let typed = ErrorInfo::from_value(Some(&json!({"type": "Timeout", "message": "slow"})))
            .unwrap();
        assert_eq!(typed.error_type, "Timeout");
        assert_eq!(typed.message.as_deref(), Some("slow"));

        let plain = ErrorInfo::from_value(Some(&json!("boom"))).unwrap();
        assert_eq!(plain.error_type, ErrorInfo::OTHER);
        assert_eq!(plain.message.as_deref(), Some("boom"));

        assert_eq!(ErrorInfo::from_value(Some(&Value::Null)), None);
    }

    #[test]
    fn test_session_end_outcome() {
        let decode = |status: Value| match EventPayload::decode(
            EventCategory::SessionEnd,
            &json!({ "status": status }),
        ) {
            EventPayload::SessionEnd(end) => end.outcome,
            _ => unreachable!(),
        };
        assert_eq!(decode(json!("completed")), Some(SessionOutcome::Completed));
        assert_eq!(decode(json!("canceled")), Some(SessionOutcome::Cancelled));
        assert_eq!(decode(json!("error")), Some(SessionOutcome::Error));
        assert_eq!(decode(json!("weird")), None);
        assert_eq!(decode(Value::Null), None);
    }

    #[test]
    fn test_fork_parent_key() {
        let payload = EventPayload::decode(
            EventCategory::SessionFork,
            &json!({"session_id": "child", "parent": "root"}),
        );
        assert_eq!(
            payload,
            EventPayload::SessionFork(SessionFork {
                parent_id: Some("root".to_string()),
                user_id: None,
            })
        );
    }
}
