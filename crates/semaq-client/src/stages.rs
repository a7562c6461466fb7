//! The known pipeline stage catalog.
//!
//! Stage ids are wire values owned by the backend's workflow graph; the
//! catalog only supplies display names and a canonical ordering for status
//! boards. Stages not listed here still flow through the tracker and
//! display untouched, ordered after the known ones.

/// Canonical execution order of the query-answering workflow, including the
/// synthetic terminal entry.
pub const STAGE_ORDER: &[&str] = &[
    "classifyJoy",
    "splitQuestion",
    "modelSelector",
    "extractMetrics",
    "extractFilters",
    "extractOrderByAndLimit",
    "manipulation",
    "smq2sql",
    "executeQuery",
    "postprocess",
    "respondent",
    "complete",
];

/// Stage id of the synthetic terminal entry written on `complete`.
pub const COMPLETE_STAGE: &str = "complete";

/// Stage whose `thought` events carry a `postprocess_result` override.
pub const POSTPROCESS_STAGE: &str = "postprocess";

/// Tool name of the human-in-the-loop clarification call.
pub const RE_QUESTION_TOOL: &str = "HumanInTheLoop.reQuestion";

/// Human-readable label for a stage id. Unknown ids are shown verbatim.
pub fn stage_label(step: &str) -> &str {
    match step {
        "classifyJoy" => "Question classification",
        "splitQuestion" => "Question split",
        "modelSelector" => "Model selection",
        "extractMetrics" => "Metric extraction",
        "extractFilters" => "Filter extraction",
        "extractOrderByAndLimit" => "Order & limit extraction",
        "manipulation" => "SMQ assembly",
        "smq2sql" => "SQL conversion",
        "executeQuery" => "Query execution",
        "postprocess" => "Post-processing",
        "respondent" => "Response generation",
        "complete" => "Complete",
        other => other,
    }
}

/// Position of a stage in the canonical order, `None` for unknown stages.
pub fn stage_position(step: &str) -> Option<usize> {
    STAGE_ORDER.iter().position(|known| *known == step)
}

/// Ordering key that sorts known stages by pipeline position and unknown
/// stages after them, stable by id.
pub fn stage_sort_key(step: &str) -> (usize, &str) {
    (stage_position(step).unwrap_or(usize::MAX), step)
}
