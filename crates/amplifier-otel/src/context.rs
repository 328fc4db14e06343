//! Trace identifiers and W3C `traceparent` propagation.
//!
//! Every span carries a [`TraceContext`]. Within one distributed trace the
//! `trace_id` is shared by the root session and every forked descendant, and
//! the `sampled` flag decided at the root is inherited unchanged.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TRACEPARENT_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

/// Errors produced when parsing a `traceparent` header value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceContextError {
    #[error("malformed traceparent: {0}")]
    Malformed(String),
    #[error("unsupported traceparent version: {0}")]
    UnsupportedVersion(String),
    #[error("traceparent carries an all-zero {0} id")]
    ZeroId(&'static str),
}

/// Identity of one span within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub sampled: bool,
}

impl TraceContext {
    /// Context for the root span of a brand new trace.
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            sampled,
        }
    }

    /// Context for a new span parented to `self`.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
        }
    }

    /// Renders the W3C `traceparent` value for this span.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{}-{:032x}-{:016x}-{:02x}",
            TRACEPARENT_VERSION, self.trace_id, self.span_id, flags
        )
    }

    /// Parses a W3C `traceparent` value.
    ///
    /// The parsed context describes the *remote* span; its `parent_span_id`
    /// is unknown and therefore `None`. Use [`TraceContext::child`] to
    /// continue the trace locally.
    pub fn from_traceparent(value: &str) -> Result<Self, TraceContextError> {
        let value = value.trim();
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() < 4 {
            return Err(TraceContextError::Malformed(value.to_string()));
        }

        let version = parts[0];
        if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TraceContextError::Malformed(value.to_string()));
        }
        if version == "ff" || (version == TRACEPARENT_VERSION && parts.len() != 4) {
            return Err(TraceContextError::UnsupportedVersion(version.to_string()));
        }

        let (trace_hex, span_hex, flags_hex) = (parts[1], parts[2], parts[3]);
        if trace_hex.len() != 32 || span_hex.len() != 16 || flags_hex.len() != 2 {
            return Err(TraceContextError::Malformed(value.to_string()));
        }

        let malformed = |_| TraceContextError::Malformed(value.to_string());
        let trace_id = u128::from_str_radix(trace_hex, 16).map_err(malformed)?;
        let span_id = u64::from_str_radix(span_hex, 16).map_err(malformed)?;
        let flags = u8::from_str_radix(flags_hex, 16).map_err(malformed)?;

        if trace_id == 0 {
            return Err(TraceContextError::ZeroId("trace"));
        }
        if span_id == 0 {
            return Err(TraceContextError::ZeroId("span"));
        }

        Ok(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: flags & FLAG_SAMPLED != 0,
        })
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}

impl FromStr for TraceContext {
    type Err = TraceContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_traceparent(s)
    }
}

/// Random non-zero 128-bit trace id.
pub fn generate_trace_id() -> u128 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u128 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Random non-zero 64-bit span id.
pub fn generate_span_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Ratio-based sampling decision keyed on the trace id.
///
/// Deterministic for a given trace id, so every process that sees the same
/// trace makes the same decision.
pub fn should_sample(trace_id: u128, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }
    let bound = (rate * (1u64 << 63) as f64) as u64;
    ((trace_id as u64) >> 1) < bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_format() {
        let ctx = TraceContext {
            trace_id: 0x4bf92f3577b34da6a3ce929d0e0e4736,
            span_id: 0x00f067aa0ba902b7,
            parent_span_id: None,
            sampled: true,
        };
        assert_eq!(
            ctx.to_traceparent(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[test]
    fn test_traceparent_parse() {
        let ctx: TraceContext = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"
            .parse()
            .unwrap();
        assert_eq!(ctx.trace_id, 0x4bf92f3577b34da6a3ce929d0e0e4736);
        assert_eq!(ctx.span_id, 0x00f067aa0ba902b7);
        assert!(!ctx.sampled);
        assert_eq!(ctx.parent_span_id, None);
    }

    #[test]
    fn test_traceparent_rejects_bad_values() {
        assert!(matches!(
            TraceContext::from_traceparent("garbage"),
            Err(TraceContextError::Malformed(_))
        ));
        assert_eq!(
            TraceContext::from_traceparent(
                "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
            ),
            Err(TraceContextError::ZeroId("trace"))
        );
        assert_eq!(
            TraceContext::from_traceparent(
                "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01"
            ),
            Err(TraceContextError::ZeroId("span"))
        );
        assert!(matches!(
            TraceContext::from_traceparent(
                "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            ),
            Err(TraceContextError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_future_version_with_extra_fields_is_accepted() {
        let ctx = TraceContext::from_traceparent(
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        )
        .unwrap();
        assert!(ctx.sampled);
    }

    #[test]
    fn test_child_keeps_trace() {
        let root = TraceContext::new_root(true);
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert!(child.sampled);
    }

    #[test]
    fn test_sampling_bounds() {
        let id = generate_trace_id();
        assert!(should_sample(id, 1.0));
        assert!(!should_sample(id, 0.0));
        assert_eq!(should_sample(id, 0.5), should_sample(id, 0.5));
    }
}
