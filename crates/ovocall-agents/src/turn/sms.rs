use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::{RecordKind, SharedFields, in_processing_order};
use crate::jsonl::Record;
use crate::text::{
    CONSENT, NEWLINE_RUN, SEMICOLON_RUN, clean, coerce_bool, collect_texts, first_present,
    value_text,
};

const CALL_REQUEST_LINE_CAP: usize = 200;
const CALL_REQUEST_TEXT_CAP: usize = 800;
const CALL_REQUEST_MAX_LINES: usize = 5;

const DEFAULT_OPENING: [&str; 2] = ["喂？", "现在方便说话吗？"];
const DEFAULT_DECLINED: [&str; 2] = ["好吧…", "那我先挂了。"];
const DEFAULT_MISSED: [&str; 2] = ["你没接…", "看到再回我一下。"];

static SENTENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^。！？!?]+[。！？!?]?").expect("sentence regex should compile")
});

/// One turn on the SMS surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsTurn {
    pub messages: Vec<String>,
    pub friend_request: Option<FriendRequest>,
    pub call_request: Option<CallRequest>,
    #[serde(flatten)]
    pub shared: SharedFields,
}

impl SmsTurn {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.friend_request.is_none()
            && self.call_request.is_none()
            && self.shared.is_empty()
    }
}

/// The counterpart asks to be added as a friend. Only produced for an explicit yes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendRequest {
    pub send: bool,
    pub reason: String,
}

/// Lines for an incoming call the counterpart places from the SMS thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRequest {
    pub opening: Vec<String>,
    pub declined: Vec<String>,
    pub missed: Vec<String>,
}

impl CallRequest {
    fn from_record(record: &Value) -> Self {
        let group = |keys: &[&str], fallback: &[&str]| {
            let mut lines = call_request_lines(first_present(record, keys));
            lines.truncate(CALL_REQUEST_MAX_LINES);
            if lines.is_empty() {
                fallback.iter().map(|s| s.to_string()).collect()
            } else {
                lines
            }
        };
        Self {
            opening: group(&["opening", "open", "ring", "answer"], &DEFAULT_OPENING),
            declined: group(&["declined", "decline", "reject"], &DEFAULT_DECLINED),
            missed: group(&["missed", "timeout", "unanswered"], &DEFAULT_MISSED),
        }
    }
}

/// Lines of one call-request group. Lists are taken item by item; a single string is
/// split on newlines, then semicolons, then sentence-ending punctuation.
fn call_request_lines(raw: Option<&Value>) -> Vec<String> {
    let line = |text: &str| clean(text, CALL_REQUEST_LINE_CAP);
    let keep = |parts: Vec<String>| -> Vec<String> {
        parts.into_iter().filter(|p| !p.is_empty()).collect()
    };

    match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => keep(items.iter().map(|v| line(&value_text(v))).collect()),
        Some(other) => {
            let text = clean(&value_text(other), CALL_REQUEST_TEXT_CAP);
            if text.is_empty() {
                return Vec::new();
            }
            let parts: Vec<String> = if text.contains('\n') {
                NEWLINE_RUN.split(&text).map(line).collect()
            } else if text.contains(';') || text.contains('；') {
                SEMICOLON_RUN.split(&text).map(line).collect()
            } else {
                SENTENCE.find_iter(&text).map(|m| line(m.as_str())).collect()
            };
            keep(parts)
        }
    }
}

fn friend_request(record: &Value) -> Option<FriendRequest> {
    let decision = coerce_bool(
        first_present(
            record,
            &["send", "approved", "value", "decision", "accepted", "action"],
        ),
        CONSENT,
    );
    if decision != Some(true) {
        return None;
    }

    let mut parts = Vec::new();
    collect_texts(
        first_present(record, &["reason", "note", "message", "text"]),
        &mut parts,
    );
    Some(FriendRequest {
        send: true,
        reason: parts.join("\n").trim().to_string(),
    })
}

pub fn interpret_sms(records: &[Record]) -> Option<SmsTurn> {
    let mut turn = SmsTurn::default();

    for (kind, record) in in_processing_order(records) {
        match kind {
            RecordKind::Sms => collect_texts(
                first_present(
                    &record,
                    &["message", "messages", "content", "text", "value"],
                ),
                &mut turn.messages,
            ),
            RecordKind::FriendRequest => {
                if let Some(request) = friend_request(&record) {
                    turn.friend_request = Some(request);
                }
            }
            RecordKind::CallRequest => turn.call_request = Some(CallRequest::from_record(&record)),
            other => {
                turn.shared.absorb(other, &record);
            }
        }
    }

    if turn.is_empty() { None } else { Some(turn) }
}
