//! Pull request references embedded in free-form issue text.

use std::sync::LazyLock;

use regex::Regex;

static PR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)github\.com/[^/\s]+/[^/\s]+/pull/(\d+)",
        r"(?i)PR[:\s#]+(\d+)",
        r"(?i)Pull Request[:\s#]+(\d+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("pr reference pattern should be valid"))
    .collect()
});

/// Extract a PR number from `text`, trying URL form first.
pub fn extract_pr_number(text: &str) -> Option<u64> {
    PR_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

/// Search the description first, then comments in the given (newest-first) order.
pub fn find_pr_in_texts<'a, I>(description: &str, comments: I) -> Option<u64>
where
    I: IntoIterator<Item = &'a str>,
{
    extract_pr_number(description)
        .or_else(|| comments.into_iter().find_map(extract_pr_number))
}
