//! Placeholder substitution for action instruction templates.
//!
//! Templates use `{name}` placeholders and `{{` / `}}` for literal braces.
//! Rendering runs in two passes over an *escaped* intermediate form:
//!
//! 1. Substitution: the template is scanned once. Placeholders with a context
//!    entry are replaced by the value, string values escaped first. Everything
//!    else (unknown placeholders, stray braces) is emitted escaped.
//! 2. Unescaping: every `{{` / `}}` pair collapses to a single brace.
//!
//! After pass 1 all braces that came from context strings are doubled, so pass 2
//! turns them back into exactly the text the tracker supplied. A value such as
//! `{secret}` therefore reaches the agent as the literal text `{secret}` and is
//! never looked up as another placeholder.

use serde_json::{Map, Value};

/// Double every brace so the text survives the unescaping pass verbatim.
pub fn escape_placeholders(value: &str) -> String {
    value.replace('{', "{{").replace('}', "}}")
}

/// Render `template` with `context`. Never fails; unknown placeholders are kept literally.
pub fn render_template(template: &str, context: &Map<String, Value>) -> String {
    unescape(&substitute(template, context))
}

fn substitute(template: &str, context: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '}']) {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..2]);
            rest = &rest[2..];
            continue;
        }

        let closing = if rest.starts_with('{') { rest.find('}') } else { None };
        if let Some(end) = closing {
            let name = &rest[1..end];
            if is_placeholder_name(name) {
                match context.get(name) {
                    Some(value) => out.push_str(&render_value(value)),
                    None => out.push_str(&escape_placeholders(&rest[..=end])),
                }
                rest = &rest[end + 1..];
                continue;
            }
        }

        // Stray brace: keep it literal.
        let brace = &rest[..1];
        out.push_str(brace);
        out.push_str(brace);
        rest = &rest[1..];
    }

    out.push_str(rest);
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => escape_placeholders(text),
        Value::Null => String::new(),
        // Escaped only for the unescaping pass; the JSON text comes out unchanged.
        other => escape_placeholders(&other.to_string()),
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn unescape(escaped: &str) -> String {
    escaped.replace("{{", "{").replace("}}", "}")
}
