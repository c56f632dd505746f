//! Text coercion shared by the record interpreters and the persona normalizer.
//!
//! Model output is loosely typed: a field that should hold a string may hold a
//! number, an array of fragments, or nothing at all. Everything here accepts a
//! `serde_json::Value` and degrades to an empty result instead of failing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Cap for names, labels and other single-line attributes.
pub const SHORT_CAP: usize = 60;
/// Cap for descriptive attributes and message bodies.
pub const LONG_CAP: usize = 240;

static SAFE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<SAFE>.*?</SAFE>").expect("safe block regex should compile")
});

static SAFE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<SAFE\s*/?>").expect("safe marker regex should compile"));

pub(crate) static NEWLINE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n+").expect("newline regex should compile"));

pub(crate) static SEMICOLON_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[;；]+").expect("semicolon regex should compile"));

/// Remove anti-truncation `<SAFE>` markers the model pads its output with, then trim.
pub fn strip_safe_tags(text: &str) -> String {
    let without_blocks = SAFE_BLOCK.replace_all(text, "");
    SAFE_MARKER
        .replace_all(&without_blocks, "")
        .trim()
        .to_string()
}

pub fn truncate_chars(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Strip markers, trim and cap to `cap` characters.
pub fn clean(text: &str, cap: usize) -> String {
    truncate_chars(&strip_safe_tags(text), cap)
}

/// Loose string view of a JSON value. `null` and objects read as empty.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null | Value::Object(_) => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
    }
}

/// First key whose value is present and not `null`.
pub fn first_present<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
}

/// First key whose value is truthy: non-empty string, non-zero number, `true`,
/// or any array/object.
pub fn first_truthy<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| record.get(*k)).find(|v| is_truthy(v))
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn normalize_short(value: Option<&Value>) -> String {
    value.map(|v| clean(&value_text(v), SHORT_CAP)).unwrap_or_default()
}

pub fn normalize_long(value: Option<&Value>) -> String {
    value.map(|v| clean(&value_text(v), LONG_CAP)).unwrap_or_default()
}

/// Split one free-text value into display fragments: on newlines when it has any,
/// otherwise on semicolons (ASCII or full-width). Empty fragments are dropped.
pub fn split_fragments(text: &str) -> Vec<String> {
    let text = strip_safe_tags(text);
    if text.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = if text.contains('\n') {
        NEWLINE_RUN.split(&text).collect()
    } else if text.contains(';') || text.contains('；') {
        SEMICOLON_RUN.split(&text).collect()
    } else {
        vec![text.as_str()]
    };
    parts
        .into_iter()
        .map(strip_safe_tags)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Append every fragment found in `raw`, recursing into arrays.
pub fn collect_texts(raw: Option<&Value>, out: &mut Vec<String>) {
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for item in items {
                collect_texts(Some(item), out);
            }
        }
        Some(other) => out.extend(split_fragments(&value_text(other))),
    }
}

/// Words accepted as an explicit yes or no for a boolean field.
#[derive(Debug, Clone, Copy)]
pub struct BoolVocabulary {
    pub truthy: &'static [&'static str],
    pub falsy: &'static [&'static str],
}

/// Hang-up decisions on the call surface.
pub const HANGUP: BoolVocabulary = BoolVocabulary {
    truthy: &["hangup", "end", "stop", "true", "yes", "1"],
    falsy: &["continue", "false", "no", "0"],
};

/// Consent decisions: unblocking the user, sending a friend request.
pub const CONSENT: BoolVocabulary = BoolVocabulary {
    truthy: &["send", "apply", "request", "approve", "yes", "true", "1"],
    falsy: &["no", "false", "0", "skip"],
};

/// Coerce a loosely typed decision. `None` means "no decision", so callers keep
/// whatever they had before.
pub fn coerce_bool(raw: Option<&Value>, vocabulary: BoolVocabulary) -> Option<bool> {
    match raw? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => {
            let lowered = s.trim().to_lowercase();
            if lowered.is_empty() {
                None
            } else if vocabulary.truthy.contains(&lowered.as_str()) {
                Some(true)
            } else if vocabulary.falsy.contains(&lowered.as_str()) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}
