//! Debug assertion macros for span tree invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is zero
//! overhead in release builds.

// =============================================================================
// Trace propagation
// =============================================================================

/// Assert that a child span continues its parent's trace.
///
/// **Invariant**: `child.trace_id == parent.trace_id ∧ child.parent == parent.span_id`
///
/// Used in: `SessionSpanTree::push_tool()`, `SpanManager` fork handling
macro_rules! debug_assert_child_of {
    ($child:expr, $parent:expr) => {
        debug_assert!(
            $child.trace_id == $parent.trace_id && $child.parent_span_id == Some($parent.span_id),
            "span {:016x} is not a child of {:016x} in trace {:032x}",
            $child.span_id,
            $parent.span_id,
            $parent.trace_id
        )
    };
}

// =============================================================================
// Sampling inheritance
// =============================================================================

/// Assert that a descendant kept the root's sampling decision.
///
/// **Invariant**: `descendant.sampled == root.sampled`
///
/// Used in: `SessionSpanTree` span creation
macro_rules! debug_assert_sampling_inherited {
    ($descendant:expr, $root:expr) => {
        debug_assert!(
            $descendant.sampled == $root.sampled,
            "span {:016x} changed the sampling decision of its trace",
            $descendant.span_id
        )
    };
}

// =============================================================================
// Session close
// =============================================================================

/// Assert that closing a session left nothing open.
///
/// **Invariant**: `session closed → tool_stack = ∅ ∧ turn = ∅ ∧ paired = ∅`
///
/// Used in: `SessionSpanTree::close()`
macro_rules! debug_assert_tree_drained {
    ($tree:expr) => {
        debug_assert!(
            $tree.open_span_count() == 1,
            "session {} closed with {} spans besides the root still open",
            $tree.session_id(),
            $tree.open_span_count().saturating_sub(1)
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_child_of;
pub(crate) use debug_assert_sampling_inherited;
pub(crate) use debug_assert_tree_drained;
