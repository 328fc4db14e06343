//! Counters and histograms derived from completed operations.
//!
//! Instruments are created once with the [`MetricsRecorder`]. Recording only
//! builds a [`MetricPoint`] and hands it to the export queue; nothing is
//! aggregated or read back in-process.

use crate::attributes::{keys, sanitize_source};
use crate::handoff::ExportHandle;
use crate::span::{now_unix_nanos, AttributeValue, Attributes};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Histogram,
}

/// Static description of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instrument {
    pub name: &'static str,
    pub kind: MetricKind,
    pub unit: &'static str,
    pub description: &'static str,
}

pub mod instruments {
    use super::{Instrument, MetricKind};

    pub const TOKEN_USAGE: Instrument = Instrument {
        name: "gen_ai.client.token.usage",
        kind: MetricKind::Histogram,
        unit: "{token}",
        description: "Number of input and output tokens used per LLM call",
    };

    pub const OPERATION_DURATION: Instrument = Instrument {
        name: "gen_ai.client.operation.duration",
        kind: MetricKind::Histogram,
        unit: "s",
        description: "Duration of LLM and tool operations",
    };

    pub const TOOL_DURATION: Instrument = Instrument {
        name: "amplifier.tool.duration",
        kind: MetricKind::Histogram,
        unit: "s",
        description: "Tool execution duration",
    };

    pub const SESSION_DURATION: Instrument = Instrument {
        name: "amplifier.session.duration",
        kind: MetricKind::Histogram,
        unit: "s",
        description: "Total session duration",
    };

    pub const TOOL_CALLS: Instrument = Instrument {
        name: "amplifier.tool.calls",
        kind: MetricKind::Counter,
        unit: "{call}",
        description: "Number of tool invocations",
    };

    pub const LLM_CALLS: Instrument = Instrument {
        name: "amplifier.llm.calls",
        kind: MetricKind::Counter,
        unit: "{call}",
        description: "Number of LLM calls",
    };

    pub const SESSIONS_STARTED: Instrument = Instrument {
        name: "amplifier.sessions.started",
        kind: MetricKind::Counter,
        unit: "{session}",
        description: "Number of sessions started, forked or resumed",
    };

    pub const TURNS_COMPLETED: Instrument = Instrument {
        name: "amplifier.turns.completed",
        kind: MetricKind::Counter,
        unit: "{turn}",
        description: "Number of completed turns",
    };

    pub const BUNDLE_USED: Instrument = Instrument {
        name: "amplifier.bundle.used",
        kind: MetricKind::Counter,
        unit: "{use}",
        description: "Bundle add, activate and load operations",
    };

    pub const ALL: &[Instrument] = &[
        TOKEN_USAGE,
        OPERATION_DURATION,
        TOOL_DURATION,
        SESSION_DURATION,
        TOOL_CALLS,
        LLM_CALLS,
        SESSIONS_STARTED,
        TURNS_COMPLETED,
        BUNDLE_USED,
    ];
}

/// One measurement, emitted and forgotten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub unit: String,
    pub attributes: Attributes,
    /// Unix nanoseconds
    pub timestamp: u64,
}

impl MetricPoint {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// Batch of metric points for export
#[derive(Debug, Clone)]
pub struct MetricBatch {
    pub points: Vec<MetricPoint>,
    pub timestamp: SystemTime,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::with_points(Vec::new())
    }

    pub fn with_points(points: Vec<MetricPoint>) -> Self {
        Self {
            points,
            timestamp: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Default for MetricBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// How a session came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    New,
    Fork,
    Resume,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Fork => "fork",
            Self::Resume => "resume",
        }
    }
}

/// Bundle lifecycle operations reported through the telemetry API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOperation {
    Add,
    Activate,
    Load,
}

impl BundleOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Activate => "activate",
            Self::Load => "load",
        }
    }
}

/// A finished unit of work to be measured.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletedOperation<'a> {
    LlmCall {
        provider: &'a str,
        model: &'a str,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        duration_secs: f64,
        error_type: Option<&'a str>,
    },
    ToolCall {
        tool_name: &'a str,
        duration_secs: f64,
        error_type: Option<&'a str>,
    },
    SessionStarted {
        session_type: SessionType,
        user_id: Option<&'a str>,
    },
    SessionEnded {
        status: &'a str,
        duration_secs: f64,
    },
    TurnCompleted {
        turn_number: u64,
    },
    BundleUsed {
        name: &'a str,
        operation: BundleOperation,
        version: Option<&'a str>,
        source: Option<&'a str>,
    },
}

/// Handle on one counter instrument.
#[derive(Debug, Clone)]
pub struct Counter {
    instrument: Instrument,
    sink: ExportHandle,
}

impl Counter {
    pub fn add(&self, value: u64, attributes: Attributes) {
        emit(&self.sink, self.instrument, value as f64, attributes);
    }
}

/// Handle on one histogram instrument.
#[derive(Debug, Clone)]
pub struct Histogram {
    instrument: Instrument,
    sink: ExportHandle,
}

impl Histogram {
    pub fn record(&self, value: f64, attributes: Attributes) {
        emit(&self.sink, self.instrument, value, attributes);
    }
}

fn emit(sink: &ExportHandle, instrument: Instrument, value: f64, attributes: Attributes) {
    // A full queue is already counted by the handoff.
    let _ = sink.submit_metric(MetricPoint {
        name: instrument.name.to_string(),
        kind: instrument.kind,
        value,
        unit: instrument.unit.to_string(),
        attributes,
        timestamp: now_unix_nanos(),
    });
}

/// Long-lived instrument handles.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    token_usage: Histogram,
    operation_duration: Histogram,
    tool_duration: Histogram,
    session_duration: Histogram,
    tool_calls: Counter,
    llm_calls: Counter,
    sessions_started: Counter,
    turns_completed: Counter,
    bundle_used: Counter,
}

impl MetricsRecorder {
    pub fn new(sink: ExportHandle) -> Self {
        let histogram = |instrument| Histogram {
            instrument,
            sink: sink.clone(),
        };
        let counter = |instrument| Counter {
            instrument,
            sink: sink.clone(),
        };
        Self {
            token_usage: histogram(instruments::TOKEN_USAGE),
            operation_duration: histogram(instruments::OPERATION_DURATION),
            tool_duration: histogram(instruments::TOOL_DURATION),
            session_duration: histogram(instruments::SESSION_DURATION),
            tool_calls: counter(instruments::TOOL_CALLS),
            llm_calls: counter(instruments::LLM_CALLS),
            sessions_started: counter(instruments::SESSIONS_STARTED),
            turns_completed: counter(instruments::TURNS_COMPLETED),
            bundle_used: counter(instruments::BUNDLE_USED),
        }
    }

    pub fn record(&self, operation: &CompletedOperation<'_>) {
        match *operation {
            CompletedOperation::LlmCall {
                provider,
                model,
                input_tokens,
                output_tokens,
                duration_secs,
                error_type,
            } => {
                let base = attrs([
                    (keys::GEN_AI_OPERATION_NAME, "chat".into()),
                    (keys::GEN_AI_SYSTEM, provider.into()),
                    (keys::GEN_AI_REQUEST_MODEL, model.into()),
                ]);
                for (token_type, count) in [("input", input_tokens), ("output", output_tokens)] {
                    if let Some(count) = count {
                        let mut a = base.clone();
                        a.insert(keys::GEN_AI_TOKEN_TYPE.to_string(), token_type.into());
                        self.token_usage.record(count as f64, a);
                    }
                }

                let mut duration_attrs = base;
                if let Some(error_type) = error_type {
                    duration_attrs.insert(keys::ERROR_TYPE.to_string(), error_type.into());
                }
                self.operation_duration.record(duration_secs, duration_attrs);

                self.llm_calls.add(
                    1,
                    attrs([
                        (keys::GEN_AI_SYSTEM, provider.into()),
                        (keys::GEN_AI_REQUEST_MODEL, model.into()),
                        (keys::LLM_SUCCESS, error_type.is_none().into()),
                    ]),
                );
            }
            CompletedOperation::ToolCall {
                tool_name,
                duration_secs,
                error_type,
            } => {
                let mut duration_attrs = attrs([
                    (keys::GEN_AI_OPERATION_NAME, "execute_tool".into()),
                    (keys::TOOL_NAME, tool_name.into()),
                ]);
                if let Some(error_type) = error_type {
                    duration_attrs.insert(keys::ERROR_TYPE.to_string(), error_type.into());
                }
                self.operation_duration.record(duration_secs, duration_attrs);

                let call_attrs = attrs([
                    (keys::TOOL_NAME, tool_name.into()),
                    (keys::TOOL_SUCCESS, error_type.is_none().into()),
                ]);
                self.tool_duration.record(duration_secs, call_attrs.clone());
                self.tool_calls.add(1, call_attrs);
            }
            CompletedOperation::SessionStarted {
                session_type,
                user_id,
            } => {
                let mut a = attrs([(keys::SESSION_TYPE, session_type.as_str().into())]);
                if let Some(user_id) = user_id {
                    a.insert(keys::USER_ID.to_string(), user_id.into());
                }
                self.sessions_started.add(1, a);
            }
            CompletedOperation::SessionEnded {
                status,
                duration_secs,
            } => {
                self.session_duration
                    .record(duration_secs, attrs([(keys::SESSION_STATUS, status.into())]));
            }
            CompletedOperation::TurnCompleted { turn_number } => {
                self.turns_completed
                    .add(1, attrs([(keys::TURN_NUMBER, turn_number.into())]));
            }
            CompletedOperation::BundleUsed {
                name,
                operation,
                version,
                source,
            } => {
                let mut a = attrs([
                    (keys::BUNDLE_NAME, name.into()),
                    (keys::BUNDLE_OPERATION, operation.as_str().into()),
                    (keys::BUNDLE_SOURCE, sanitize_source(source).into()),
                ]);
                if let Some(version) = version {
                    a.insert(keys::BUNDLE_VERSION.to_string(), version.into());
                }
                self.bundle_used.add(1, a);
            }
        }
    }
}

fn attrs<const N: usize>(pairs: [(&str, AttributeValue); N]) -> Attributes {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
