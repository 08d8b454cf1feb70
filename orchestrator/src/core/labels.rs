//! Intent label vocabulary and per-issue worklists.

use crate::core::types::Issue;

/// Label marking an issue as being processed.
pub const DEFAULT_LOCK_LABEL: &str = "ai-processing";

pub const LABEL_INVESTIGATE: &str = "ai-investigate";
pub const LABEL_IMPACT: &str = "ai-impact";
pub const LABEL_RECOMMEND: &str = "ai-recommend";
pub const LABEL_FIX: &str = "ai-fix";
pub const LABEL_IMPLEMENT: &str = "ai-implement";
pub const LABEL_CODE_REVIEW: &str = "ai-code-review";
pub const LABEL_SECURITY_REVIEW: &str = "ai-security-review";

/// Default intent vocabulary.
pub fn default_intent_labels() -> Vec<String> {
    [
        LABEL_INVESTIGATE,
        LABEL_IMPACT,
        LABEL_RECOMMEND,
        LABEL_FIX,
        LABEL_IMPLEMENT,
        LABEL_CODE_REVIEW,
        LABEL_SECURITY_REVIEW,
    ]
    .iter()
    .map(|label| label.to_string())
    .collect()
}

/// Intent labels present on `issue`, in ascending lexicographic order.
///
/// The issue label set is ordered, so the worklist is deterministic regardless
/// of the order of `vocabulary`.
pub fn intent_worklist(issue: &Issue, vocabulary: &[String]) -> Vec<String> {
    issue
        .labels
        .iter()
        .filter(|label| vocabulary.iter().any(|intent| intent == *label))
        .cloned()
        .collect()
}
