//! Per-session span tree.
//!
//! A [`SessionSpanTree`] owns every open span of one session: the root, the
//! current turn, a LIFO stack of in-flight tool spans, the in-flight LLM call
//! and any open paired operation (prompt, plan, approval, cancellation).
//!
//! New spans are parented to the *innermost open span*: the top of the tool
//! stack, else the turn, else the root. LLM and paired spans are deliberately
//! not part of that chain; they never become parents.

use crate::attributes::keys;
use crate::context::TraceContext;
use crate::invariants::{
    debug_assert_child_of, debug_assert_sampling_inherited, debug_assert_tree_drained,
};
use crate::span::{Attributes, FinishedSpan, Span, SpanKind, SpanStatus};

pub const SESSION_SPAN_NAME: &str = "amplifier.session";
pub const TURN_SPAN_NAME: &str = "amplifier.turn";

/// Operations with a start event and a matching end event that are tracked
/// outside the tool stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairedOperation {
    Prompt,
    Plan,
    Approval,
    Cancellation,
}

impl PairedOperation {
    pub fn span_name(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Plan => "plan",
            Self::Approval => "approval_pending",
            Self::Cancellation => "cancellation",
        }
    }
}

/// One entry of the tool stack.
#[derive(Debug)]
pub struct ToolFrame {
    pub tool_name: String,
    pub span: Span,
}

/// Span name for a tool invocation.
pub fn tool_span_name(tool_name: &str) -> String {
    format!("execute_tool {tool_name}")
}

/// All open spans of one session.
#[derive(Debug)]
pub struct SessionSpanTree {
    session_id: String,
    root: Span,
    turn: Option<Span>,
    tool_stack: Vec<ToolFrame>,
    llm: Option<Span>,
    paired: Vec<(PairedOperation, Span)>,
    turn_count: u64,
    cancel_requested: bool,
}

impl SessionSpanTree {
    /// Opens the root span of a session with an already-decided context.
    pub fn new(session_id: impl Into<String>, root_context: TraceContext, attributes: Attributes) -> Self {
        let session_id = session_id.into();
        let mut root = Span::start(root_context, SESSION_SPAN_NAME, SpanKind::Server);
        root.set_attribute(keys::SESSION_ID, session_id.as_str());
        root.extend_attributes(attributes);

        Self {
            session_id,
            root,
            turn: None,
            tool_stack: Vec::new(),
            llm: None,
            paired: Vec::new(),
            turn_count: 0,
            cancel_requested: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Context of the root span, as exposed for log correlation.
    pub fn trace_context(&self) -> TraceContext {
        *self.root.context()
    }

    /// Context of the innermost open span: tool top, else turn, else root.
    pub fn innermost_context(&self) -> TraceContext {
        *self.innermost().context()
    }

    fn innermost(&self) -> &Span {
        self.tool_stack
            .last()
            .map(|frame| &frame.span)
            .or(self.turn.as_ref())
            .unwrap_or(&self.root)
    }

    pub fn root_mut(&mut self) -> &mut Span {
        &mut self.root
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn has_open_turn(&self) -> bool {
        self.turn.is_some()
    }

    pub fn tool_depth(&self) -> usize {
        self.tool_stack.len()
    }

    /// Tool names from the bottom of the stack to the top.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tool_stack.iter().map(|f| f.tool_name.as_str())
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    /// Root, turn, tools, LLM and paired spans currently open.
    pub fn open_span_count(&self) -> usize {
        1 + usize::from(self.turn.is_some())
            + self.tool_stack.len()
            + usize::from(self.llm.is_some())
            + self.paired.len()
    }

    /// Starts a span under the innermost open span without storing it.
    pub fn start_child(&self, name: impl Into<String>, kind: SpanKind, attributes: Attributes) -> Span {
        let parent = self.innermost().context();
        let mut span = Span::child_of(parent, name, kind);
        debug_assert_child_of!(span.context(), parent);
        debug_assert_sampling_inherited!(span.context(), self.root.context());
        span.extend_attributes(attributes);
        span
    }

    // =========================================================================
    // Turns
    // =========================================================================

    /// Opens the next turn under the root.
    ///
    /// A turn that is still open is closed first and returned.
    pub fn start_turn(&mut self, attributes: Attributes) -> Option<FinishedSpan> {
        let superseded = self.turn.take().map(|mut turn| {
            turn.set_attribute(keys::TURN_SUPERSEDED, true);
            turn.end(SpanStatus::Unset, None)
        });

        self.turn_count += 1;
        let mut turn = Span::child_of(self.root.context(), TURN_SPAN_NAME, SpanKind::Internal);
        turn.set_attribute(keys::SESSION_ID, self.session_id.as_str());
        turn.set_attribute(keys::TURN_NUMBER, self.turn_count);
        turn.extend_attributes(attributes);
        self.turn = Some(turn);

        superseded
    }

    /// Closes the open turn, if any, with status OK.
    pub fn end_turn(&mut self) -> Option<FinishedSpan> {
        self.turn.take().map(|turn| turn.end(SpanStatus::Ok, None))
    }

    // =========================================================================
    // Tool stack
    // =========================================================================

    /// Pushes a tool span parented to the current innermost span.
    pub fn push_tool(&mut self, tool_name: impl Into<String>, attributes: Attributes) -> TraceContext {
        let tool_name = tool_name.into();
        let span = self.start_child(tool_span_name(&tool_name), SpanKind::Internal, attributes);
        let context = *span.context();
        self.tool_stack.push(ToolFrame { tool_name, span });
        context
    }

    /// Pops the innermost tool span. The caller ends it.
    pub fn pop_tool(&mut self) -> Option<ToolFrame> {
        self.tool_stack.pop()
    }

    // =========================================================================
    // LLM calls and paired operations
    // =========================================================================

    /// Tracks an open LLM span, returning any previous one closed as UNSET.
    pub fn begin_llm(&mut self, span: Span) -> Option<FinishedSpan> {
        self.llm
            .replace(span)
            .map(|previous| previous.end(SpanStatus::Unset, None))
    }

    pub fn take_llm(&mut self) -> Option<Span> {
        self.llm.take()
    }

    /// Tracks an open paired span, returning any previous one of the same
    /// operation closed as UNSET.
    pub fn begin_paired(&mut self, operation: PairedOperation, span: Span) -> Option<FinishedSpan> {
        let previous = self.take_paired(operation);
        self.paired.push((operation, span));
        previous.map(|span| span.end(SpanStatus::Unset, None))
    }

    pub fn take_paired(&mut self, operation: PairedOperation) -> Option<Span> {
        let index = self.paired.iter().position(|(op, _)| *op == operation)?;
        Some(self.paired.remove(index).1)
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Closes every open span, children before parents, root last.
    ///
    /// The LLM span and paired spans never parent anything, so they go
    /// first, then tool spans innermost first. All of these are orphans:
    /// they end with ERROR and carry an `orphan_event` span event. The turn
    /// ends UNSET. The root ends with the given status.
    pub fn close(
        mut self,
        status: SpanStatus,
        status_message: Option<String>,
        orphan_event: &str,
    ) -> Vec<FinishedSpan> {
        let mut finished = Vec::with_capacity(self.open_span_count());

        let orphan = |mut span: Span| {
            span.add_event(orphan_event, Attributes::new());
            span.end(SpanStatus::Error, Some(orphan_event.to_string()))
        };

        if let Some(llm) = self.llm.take() {
            finished.push(orphan(llm));
        }
        while let Some((_, span)) = self.paired.pop() {
            finished.push(orphan(span));
        }
        while let Some(frame) = self.tool_stack.pop() {
            finished.push(orphan(frame.span));
        }
        if let Some(turn) = self.turn.take() {
            finished.push(turn.end(SpanStatus::Unset, None));
        }

        debug_assert_tree_drained!(self);

        self.root.set_attribute(keys::SESSION_TURNS, self.turn_count);
        finished.push(self.root.end(status, status_message));
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SessionSpanTree {
        SessionSpanTree::new("s1", TraceContext::new_root(true), Attributes::new())
    }

    #[test]
    fn test_innermost_follows_stack() {
        let mut tree = tree();
        let root = tree.trace_context();
        assert_eq!(tree.innermost_context(), root);

        assert!(tree.start_turn(Attributes::new()).is_none());
        let turn = tree.innermost_context();
        assert_eq!(turn.parent_span_id, Some(root.span_id));

        let a = tree.push_tool("a", Attributes::new());
        assert_eq!(a.parent_span_id, Some(turn.span_id));
        let b = tree.push_tool("b", Attributes::new());
        assert_eq!(b.parent_span_id, Some(a.span_id));
        assert_eq!(tree.innermost_context(), b);
        assert_eq!(tree.tool_names().collect::<Vec<_>>(), vec!["a", "b"]);

        let frame = tree.pop_tool().unwrap();
        assert_eq!(frame.tool_name, "b");
        assert_eq!(tree.innermost_context(), a);
    }

    #[test]
    fn test_tool_without_turn_parents_to_root() {
        let mut tree = tree();
        let tool = tree.push_tool("bash", Attributes::new());
        assert_eq!(tool.parent_span_id, Some(tree.trace_context().span_id));
    }

    #[test]
    fn test_turn_numbering_and_supersede() {
        let mut tree = tree();
        tree.start_turn(Attributes::new());
        let superseded = tree.start_turn(Attributes::new()).unwrap();
        assert_eq!(superseded.status, SpanStatus::Unset);
        assert_eq!(superseded.attribute(keys::TURN_SUPERSEDED), Some(&true.into()));
        assert_eq!(superseded.attribute(keys::TURN_NUMBER), Some(&1_u64.into()));

        let second = tree.end_turn().unwrap();
        assert_eq!(second.attribute(keys::TURN_NUMBER), Some(&2_u64.into()));
        assert_eq!(second.status, SpanStatus::Ok);
        assert!(tree.end_turn().is_none());
        assert_eq!(tree.turn_count(), 2);
    }

    #[test]
    fn test_paired_operations_are_independent() {
        let mut tree = tree();
        let prompt = tree.start_child("prompt", SpanKind::Internal, Attributes::new());
        let plan = tree.start_child("plan", SpanKind::Internal, Attributes::new());
        assert!(tree.begin_paired(PairedOperation::Prompt, prompt).is_none());
        assert!(tree.begin_paired(PairedOperation::Plan, plan).is_none());
        assert_eq!(tree.open_span_count(), 3);

        assert_eq!(tree.take_paired(PairedOperation::Prompt).unwrap().name(), "prompt");
        assert!(tree.take_paired(PairedOperation::Prompt).is_none());
        assert!(tree.take_paired(PairedOperation::Approval).is_none());
        assert_eq!(tree.open_span_count(), 2);
    }

    #[test]
    fn test_close_orphans_innermost_first() {
        let mut tree = tree();
        tree.start_turn(Attributes::new());
        tree.push_tool("outer", Attributes::new());
        let plan = tree.start_child("plan", SpanKind::Internal, Attributes::new());
        tree.begin_paired(PairedOperation::Plan, plan);
        tree.push_tool("inner", Attributes::new());
        let llm = tree.start_child("chat m", SpanKind::Client, Attributes::new());
        tree.begin_llm(llm);

        let finished = tree.close(SpanStatus::Ok, None, "session ended while span open");
        let names: Vec<_> = finished.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "chat m",
                "plan",
                "execute_tool inner",
                "execute_tool outer",
                TURN_SPAN_NAME,
                SESSION_SPAN_NAME
            ]
        );

        // Every span closes after all of its children.
        for (position, span) in finished.iter().enumerate() {
            let children_after = finished[position + 1..]
                .iter()
                .filter(|later| later.parent_span_id == Some(span.span_id))
                .count();
            assert_eq!(children_after, 0, "{} closed before a child", span.name);
            assert!(finished[..position].iter().all(|earlier| earlier.end_time <= span.end_time));
        }

        for orphan in &finished[..4] {
            assert_eq!(orphan.status, SpanStatus::Error);
            assert!(orphan.has_event("session ended while span open"));
        }
        let root = finished.last().unwrap();
        assert_eq!(root.status, SpanStatus::Ok);
        assert_eq!(root.parent_span_id, None);
        assert_eq!(root.attribute(keys::SESSION_TURNS), Some(&1_u64.into()));
    }
}
