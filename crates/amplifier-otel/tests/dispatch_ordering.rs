//! The hook assumes the kernel dispatcher runs start handlers before other
//! consumers and end handlers after them. These tests drive the hook through
//! a fake dispatcher that either honours or reverses that ordering while a
//! second consumer rewrites payloads.

use amplifier_otel::attributes::keys;
use amplifier_otel::handoff::{self, ExportReceiver};
use amplifier_otel::{
    AttributeValue, FinishedSpan, OtelConfig, OtelHook, SensitiveDataConfig, SpanStatus,
};
use serde_json::{json, Value};

type Handler = Box<dyn Fn(&str, &mut Value)>;

struct FakeDispatcher {
    handlers: Vec<(String, i32, Handler)>,
    honour_priority: bool,
}

impl FakeDispatcher {
    fn new(honour_priority: bool) -> Self {
        Self {
            handlers: Vec::new(),
            honour_priority,
        }
    }

    fn register(&mut self, event: &str, priority: i32, handler: Handler) {
        self.handlers.push((event.to_string(), priority, handler));
    }

    fn emit(&self, event: &str, mut data: Value) {
        let mut matching: Vec<_> = self.handlers.iter().filter(|(e, _, _)| e == event).collect();
        matching.sort_by_key(|(_, priority, _)| *priority);
        if !self.honour_priority {
            matching.reverse();
        }
        for (_, _, handler) in matching {
            handler(event, &mut data);
        }
    }
}

fn dispatcher(honour_priority: bool) -> (FakeDispatcher, ExportReceiver) {
    let (handle, receiver) = handoff::channel(1024);
    let config = OtelConfig::default().with_sensitive_data(SensitiveDataConfig::disabled());
    let hook = OtelHook::new(&config, handle);

    let mut dispatcher = FakeDispatcher::new(honour_priority);
    for registration in OtelHook::registrations() {
        let hook = hook.clone();
        dispatcher.register(
            registration.event,
            registration.priority,
            Box::new(move |name: &str, data: &mut Value| hook.on_event(name, data)),
        );
    }

    // A consumer that rewrites payloads at the default priority.
    dispatcher.register(
        "tool:pre",
        50,
        Box::new(|_: &str, data: &mut Value| data["tool_input"] = json!("rewritten by consumer")),
    );
    dispatcher.register(
        "tool:post",
        50,
        Box::new(|_: &str, data: &mut Value| data["result"] = json!("post-processed")),
    );

    (dispatcher, receiver)
}

fn run_session(dispatcher: &FakeDispatcher) {
    dispatcher.emit("session:start", json!({"session_id": "s1"}));
    dispatcher.emit("execution:start", json!({"session_id": "s1"}));
    dispatcher.emit(
        "tool:pre",
        json!({"session_id": "s1", "tool_name": "bash", "tool_input": "ls -la"}),
    );
    dispatcher.emit(
        "tool:post",
        json!({"session_id": "s1", "tool_name": "bash", "result": "raw output"}),
    );
    dispatcher.emit("execution:end", json!({"session_id": "s1"}));
    dispatcher.emit("session:end", json!({"session_id": "s1"}));
}

fn tool_span(receiver: &mut ExportReceiver) -> (Vec<FinishedSpan>, FinishedSpan) {
    let spans = receiver.drain_spans();
    let tool = spans
        .iter()
        .find(|s| s.name == "execute_tool bash")
        .cloned()
        .unwrap();
    (spans, tool)
}

fn attr<'a>(span: &'a FinishedSpan, key: &str) -> Option<&'a str> {
    span.attribute(key).and_then(AttributeValue::as_str)
}

#[test]
fn test_ordered_dispatch_sees_original_start_and_final_end() {
    let (dispatcher, mut receiver) = dispatcher(true);
    run_session(&dispatcher);

    let (spans, tool) = tool_span(&mut receiver);
    assert_eq!(spans.len(), 3);
    assert_eq!(attr(&tool, keys::TOOL_INPUT), Some("ls -la"));
    assert_eq!(attr(&tool, keys::TOOL_RESULT), Some("post-processed"));
    assert!(spans.iter().all(|s| s.status == SpanStatus::Ok));
}

#[test]
fn test_reversed_dispatch_degrades_gracefully() {
    let (dispatcher, mut receiver) = dispatcher(false);
    run_session(&dispatcher);

    let (spans, tool) = tool_span(&mut receiver);
    // Structure is unaffected; only attribute values reflect the rewrites.
    assert_eq!(spans.len(), 3);
    assert!(spans.iter().all(|s| s.status == SpanStatus::Ok));
    assert_eq!(attr(&tool, keys::TOOL_INPUT), Some("rewritten by consumer"));
    assert_eq!(attr(&tool, keys::TOOL_RESULT), Some("raw output"));

    let turn = spans.iter().find(|s| s.name == "amplifier.turn").unwrap();
    assert_eq!(tool.parent_span_id, Some(turn.span_id));
}
