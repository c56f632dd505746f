//! Record extraction from raw completion text.
//!
//! The model is asked for one JSON object per line, but what comes back is often
//! fenced, wrapped in reasoning tags, split across lines, or followed by a
//! self-check section. [`extract_records`] recovers as many objects as it can and
//! never fails; an empty vector is the only failure signal.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::text::strip_safe_tags;

/// One structured unit from the model output. Always a JSON object.
pub type Record = Map<String, Value>;

/// Section headers after which the model writes prose about its own output.
const CHECKLIST_MARKERS: [&str; 2] = ["【幸存者清单】", "【检查清单】"];

static ZERO_WIDTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[\u{200B}-\u{200D}\u{FEFF}]").expect("zero-width regex should compile")
});

static REASONING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(cot|thinking)\b[^>]*>.*?</(?:cot|thinking)\s*>")
        .expect("reasoning block regex should compile")
});

static REASONING_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(?:cot|thinking)[^>]*>").expect("reasoning tag regex should compile")
});

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```[a-z0-9_-]*\s*").expect("fence regex should compile")
});

/// Drop zero-width characters, reasoning blocks, code fences and `<SAFE>` padding.
pub fn strip_noise(raw: &str) -> String {
    let text = ZERO_WIDTH.replace_all(raw, "");
    let text = REASONING_BLOCK.replace_all(&text, "");
    let text = REASONING_TAG.replace_all(&text, "");
    let text = FENCE.replace_all(&text, "");
    strip_safe_tags(&text)
}

/// Everything before the earliest checklist marker.
fn cut_checklist(text: &str) -> &str {
    let cut = CHECKLIST_MARKERS
        .iter()
        .filter_map(|m| text.find(m))
        .min()
        .unwrap_or(text.len());
    &text[..cut]
}

fn is_checklist_line(line: &str) -> bool {
    CHECKLIST_MARKERS.iter().any(|m| line.starts_with(m))
}

/// Extract every record from a raw completion, in output order.
pub fn extract_records(raw: &str) -> Vec<Record> {
    let stripped = strip_noise(raw);
    if stripped.is_empty() {
        return Vec::new();
    }
    let text = cut_checklist(&stripped).trim();

    let mut records = Vec::new();
    if let Some(value) = parse_structured(text) {
        flatten_into(value, &mut records);
        return records;
    }

    reassemble_lines(text, &mut records);
    if records.is_empty() {
        scan_top_level(text, &mut records);
    }
    debug!(count = records.len(), "extracted records");
    records
}

/// Parse `candidate` as an object or array, retrying once after repairing raw line
/// breaks inside string literals.
fn parse_structured(candidate: &str) -> Option<Value> {
    let structured = |v: Value| (v.is_object() || v.is_array()).then_some(v);
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => structured(value),
        Err(_) => {
            let repaired = escape_raw_newlines(candidate);
            if repaired == candidate {
                return None;
            }
            serde_json::from_str::<Value>(&repaired).ok().and_then(structured)
        }
    }
}

/// Rewrite CR, LF, CRLF and U+2028/U+2029 found inside string literals as `\n`.
pub fn escape_raw_newlines(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = candidate.chars().peekable();

    while let Some(ch) = chars.next() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                in_string = !in_string;
            }
            '\r' if in_string => {
                out.push_str("\\n");
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\n' | '\u{2028}' | '\u{2029}' if in_string => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

fn flatten_into(value: Value, records: &mut Vec<Record>) {
    match value {
        Value::Object(map) => records.push(map),
        Value::Array(items) => {
            for item in items {
                flatten_into(item, records);
            }
        }
        _ => {}
    }
}

fn structural_start(line: &str) -> Option<usize> {
    line.find(['{', '['])
}

/// Line-by-line pass. A value that spans several lines is accumulated in a buffer;
/// a line that parses on its own while the buffer is stuck replaces the buffer.
fn reassemble_lines(text: &str, records: &mut Vec<Record>) {
    let mut buffer = String::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if is_checklist_line(line) {
            break;
        }

        if buffer.is_empty() {
            let Some(start) = structural_start(line) else {
                continue;
            };
            let candidate = &line[start..];
            match parse_structured(candidate) {
                Some(value) => flatten_into(value, records),
                None => buffer = candidate.to_string(),
            }
            continue;
        }

        let combined = format!("{buffer}\n{line}");
        if let Some(value) = parse_structured(&combined) {
            flatten_into(value, records);
            buffer.clear();
            continue;
        }

        if let Some(value) = structural_start(line).and_then(|start| parse_structured(&line[start..]))
        {
            flatten_into(value, records);
            buffer.clear();
            continue;
        }

        buffer = combined;
    }

    if !buffer.is_empty() {
        if let Some(value) = parse_structured(&buffer) {
            flatten_into(value, records);
        }
    }
}

/// Last resort: slice out every balanced top-level `{...}` / `[...]` span and try
/// each on its own.
fn scan_top_level(text: &str, records: &mut Vec<Record>) {
    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' | '[' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        if let Some(value) = parse_structured(&text[begin..=idx]) {
                            flatten_into(value, records);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn types(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .map(|r| r.get("type").and_then(Value::as_str).unwrap_or(""))
            .collect()
    }

    #[test]
    fn well_formed_lines_keep_count_and_order() {
        let raw = "{\"type\":\"persona\",\"name\":\"林晚\"}\n\
                   {\"type\":\"sms\",\"message\":\"在吗\"}\n\
                   \n\
                   {\"type\":\"notes\",\"items\":[\"a\"]}\n\
                   {\"type\":\"status\",\"value\":\"忙\"}";
        let records = extract_records(raw);
        assert_eq!(types(&records), vec!["persona", "sms", "notes", "status"]);
    }

    #[test]
    fn whole_text_array_is_flattened() {
        let raw = "[{\"type\":\"call\",\"sentence\":\"喂\"}, [{\"type\":\"hangup\",\"value\":true}], 3, null]";
        assert_eq!(types(&extract_records(raw)), vec!["call", "hangup"]);
    }

    #[test]
    fn raw_newline_inside_string_is_repaired() {
        let raw = "{\"type\":\"sms\",\"message\":\"第一行\n第二行\"}";
        assert!(serde_json::from_str::<Value>(raw).is_err());

        let records = extract_records(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], json!("第一行\n第二行"));
    }

    #[test]
    fn repair_handles_crlf_and_separators() {
        let repaired = escape_raw_newlines("{\"a\":\"x\r\ny\u{2028}z\"}\n");
        assert_eq!(repaired, "{\"a\":\"x\\ny\\nz\"}\n");
        // escaped quotes do not toggle string state
        let untouched = escape_raw_newlines("{\"a\":\"say \\\"hi\\\"\"}");
        assert_eq!(untouched, "{\"a\":\"say \\\"hi\\\"\"}");
    }

    #[test]
    fn noise_is_stripped_before_parsing() {
        let raw = "<thinking>先想想 {\"type\":\"sms\",\"message\":\"不该出现\"}</thinking>\n\
                   ```jsonl\n\u{200B}{\"type\":\"sms\",\"message\":\"你好\"}<SAFE>x</SAFE>\n```";
        let records = extract_records(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], json!("你好"));
    }

    #[test]
    fn checklist_prose_is_discarded() {
        let raw = "{\"type\":\"sms\",\"message\":\"好\"}\n\
                   【检查清单】\n\
                   {\"type\":\"sms\",\"message\":\"自检内容\"}\n\
                   - 是否符合人设：是";
        let records = extract_records(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], json!("好"));

        let inline = "{\"type\":\"status\",\"value\":\"x\"} 【幸存者清单】 {\"type\":\"status\",\"value\":\"y\"}";
        let records = extract_records(inline);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["value"], json!("x"));
    }

    #[test]
    fn multi_line_object_is_reassembled() {
        let raw = "好的，下面是输出：\n{\"type\":\"persona\",\n\"name\":\"周\",\n\"age\":\"25\"}\n{\"type\":\"call\",\"sentence\":\"喂？\"}";
        let records = extract_records(raw);
        assert_eq!(types(&records), vec!["persona", "call"]);
        assert_eq!(records[0]["age"], json!("25"));
    }

    #[test]
    fn truncated_record_does_not_swallow_the_next_one() {
        let raw = "{\"type\":\"sms\",\"message\":\"被截断\n{\"type\":\"sms\",\"message\":\"完整\"}";
        let records = extract_records(raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], json!("完整"));
    }

    #[test]
    fn prose_without_json_yields_nothing() {
        assert!(extract_records("我今天过得很好，谢谢关心。").is_empty());
        assert!(extract_records("").is_empty());
        assert!(extract_records("  \u{FEFF} ").is_empty());
        assert!(extract_records("42").is_empty());
    }

    #[test]
    fn bracket_scan_recovers_embedded_values() {
        // the line pass never closes its buffer, so the scan has to run
        let raw = "前言 {\"type\":\"status\", \"value\": \"在\"} 中间 {\"type\":\"notes\",\"items\":[\"x\"]} 以及 {broken";
        let mut line_records = Vec::new();
        reassemble_lines(raw, &mut line_records);
        assert!(line_records.is_empty());

        let records = extract_records(raw);
        assert_eq!(types(&records), vec!["status", "notes"]);
    }
}
