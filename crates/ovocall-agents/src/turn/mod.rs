//! Typed interpretation of extracted records for one conversation surface.

mod call;
mod sms;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::jsonl::{Record, extract_records};
use crate::persona::{PersonaProfile, SupplementEntry, normalize_persona, supplement_entries};
use crate::text::{
    CONSENT, coerce_bool, collect_texts, first_present, normalize_long, normalize_short,
};

pub use call::{CallTurn, interpret_call};
pub use sms::{CallRequest, FriendRequest, SmsTurn, interpret_sms};

/// Conversation surface a turn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Call,
    Sms,
}

impl std::str::FromStr for Surface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "call" => Ok(Surface::Call),
            "sms" => Ok(Surface::Sms),
            other => Err(format!("unknown surface '{other}'")),
        }
    }
}

/// Recognized record discriminants, synonyms folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Call,
    Sms,
    Hangup,
    Persona,
    RandomSms,
    RandomSmsPersona,
    PersonaSupplement,
    Notes,
    Status,
    UnblockUser,
    FriendRequest,
    CallRequest,
}

impl RecordKind {
    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag.trim().to_lowercase().as_str() {
            "call" => RecordKind::Call,
            "sms" => RecordKind::Sms,
            "hangup" => RecordKind::Hangup,
            "persona" => RecordKind::Persona,
            "randomsms" | "random_sms" => RecordKind::RandomSms,
            "randomsmspersona" | "random_sms_persona" => RecordKind::RandomSmsPersona,
            "personasupplement" | "persona_supplement" => RecordKind::PersonaSupplement,
            "notes" => RecordKind::Notes,
            "status" => RecordKind::Status,
            "unblockuser" | "unblock-user" => RecordKind::UnblockUser,
            "friendrequest" | "friend-request" => RecordKind::FriendRequest,
            "callrequest" | "call-request" | "call_request" => RecordKind::CallRequest,
            _ => return None,
        };
        Some(kind)
    }

    /// Kind of a record, read from `type`, `kind` or `recordType`.
    pub fn of(record: &Record) -> Option<Self> {
        ["type", "kind", "recordType"]
            .iter()
            .filter_map(|k| record.get(*k))
            .find(|v| !v.is_null())
            .map(crate::text::value_text)
            .and_then(|tag| Self::parse(&tag))
    }
}

/// An unrelated third-party message the model injected into the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterferenceMessage {
    #[serde(rename = "type")]
    pub sms_type: String,
    pub sender_number: String,
    pub sender_name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<PersonaProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteItem {
    pub content: String,
}

/// Fields both surfaces understand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFields {
    pub persona: Option<PersonaProfile>,
    pub random_sms: Option<InterferenceMessage>,
    pub notes: Option<Vec<NoteItem>>,
    pub status: Option<String>,
    pub unblock_user: Option<bool>,
    pub persona_supplement: Option<Vec<SupplementEntry>>,
}

impl SharedFields {
    pub fn is_empty(&self) -> bool {
        self.persona.is_none()
            && self.random_sms.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.unblock_user.is_none()
            && self.persona_supplement.is_none()
    }

    /// Apply a record that is meaningful on every surface. Returns `false` when the
    /// kind is not one of the shared ones.
    fn absorb(&mut self, kind: RecordKind, record: &Value) -> bool {
        match kind {
            RecordKind::Persona => {
                if let Some(persona) = normalize_persona(record) {
                    self.persona = Some(persona);
                }
            }
            RecordKind::RandomSms => {
                let short = |keys: &[&str]| normalize_short(first_present(record, keys));
                self.random_sms = Some(InterferenceMessage {
                    sms_type: short(&["smsType", "sms_type", "category", "randomType"]),
                    sender_number: short(&["senderNumber", "sender_number", "number"]),
                    sender_name: short(&["senderName", "sender_name", "name"]),
                    content: normalize_long(first_present(record, &["content", "message"])),
                    persona: first_present(record, &["persona", "senderPersona", "sender_persona"])
                        .and_then(normalize_persona),
                });
            }
            RecordKind::RandomSmsPersona => {
                if let Some(persona) = normalize_persona(record) {
                    self.random_sms.get_or_insert_with(Default::default).persona = Some(persona);
                }
            }
            RecordKind::PersonaSupplement => {
                let entries = supplement_entries(first_present(
                    record,
                    &[
                        "entries",
                        "items",
                        "supplements",
                        "supplement",
                        "personaSupplement",
                        "persona_supplement",
                        "content",
                        "text",
                    ],
                ));
                if !entries.is_empty() {
                    self.persona_supplement = Some(entries);
                }
            }
            RecordKind::Notes => {
                let mut items = Vec::new();
                collect_texts(
                    first_present(record, &["items", "notes", "note", "content", "text"]),
                    &mut items,
                );
                if !items.is_empty() {
                    self.notes = Some(
                        items
                            .into_iter()
                            .map(|content| NoteItem { content })
                            .collect(),
                    );
                }
            }
            RecordKind::Status => {
                let value =
                    normalize_short(first_present(record, &["value", "status", "content", "text"]));
                if !value.is_empty() {
                    self.status = Some(value);
                }
            }
            RecordKind::UnblockUser => {
                let raw = first_present(
                    record,
                    &["value", "unblock", "approved", "decision", "status", "send"],
                );
                if let Some(decision) = coerce_bool(raw, CONSENT) {
                    self.unblock_user = Some(decision);
                }
            }
            _ => return false,
        }
        true
    }
}

/// Surface-specific aggregate of one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TurnResult {
    Call(CallTurn),
    Sms(SmsTurn),
}

impl TurnResult {
    pub fn shared(&self) -> &SharedFields {
        match self {
            TurnResult::Call(turn) => &turn.shared,
            TurnResult::Sms(turn) => &turn.shared,
        }
    }

    /// Lines the counterpart said this turn.
    pub fn reply_lines(&self) -> &[String] {
        match self {
            TurnResult::Call(turn) => &turn.sentences,
            TurnResult::Sms(turn) => &turn.messages,
        }
    }
}

/// Persona records first, everything else in output order.
pub(crate) fn in_processing_order(records: &[Record]) -> Vec<(RecordKind, Value)> {
    let mut tagged: Vec<(RecordKind, Value)> = records
        .iter()
        .filter_map(|r| RecordKind::of(r).map(|kind| (kind, Value::Object(r.clone()))))
        .collect();
    tagged.sort_by_key(|(kind, _)| *kind != RecordKind::Persona);
    tagged
}

/// Extract and interpret raw model output for `surface`. `None` when nothing usable
/// was found.
pub fn interpret(raw: &str, surface: Surface) -> Option<TurnResult> {
    let records = extract_records(raw);
    if records.is_empty() {
        debug!(surface = ?surface, "no records extracted");
        return None;
    }
    interpret_records(&records, surface)
}

pub fn interpret_records(records: &[Record], surface: Surface) -> Option<TurnResult> {
    match surface {
        Surface::Call => interpret_call(records).map(TurnResult::Call),
        Surface::Sms => interpret_sms(records).map(TurnResult::Sms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn kinds_fold_synonyms_and_case() {
        assert_eq!(RecordKind::parse("randomSms"), Some(RecordKind::RandomSms));
        assert_eq!(RecordKind::parse("random_sms_persona"), Some(RecordKind::RandomSmsPersona));
        assert_eq!(RecordKind::parse(" Call-Request "), Some(RecordKind::CallRequest));
        assert_eq!(RecordKind::parse("unblock-user"), Some(RecordKind::UnblockUser));
        assert_eq!(RecordKind::parse("diary"), None);

        assert_eq!(
            RecordKind::of(&record(json!({"kind": "status"}))),
            Some(RecordKind::Status)
        );
        assert_eq!(
            RecordKind::of(&record(json!({"type": null, "recordType": "notes"}))),
            Some(RecordKind::Notes)
        );
        assert_eq!(RecordKind::of(&record(json!({"value": 1}))), None);
    }

    #[test]
    fn persona_records_move_to_the_front() {
        let records = vec![
            record(json!({"type": "sms", "message": "a"})),
            record(json!({"type": "persona", "name": "one"})),
            record(json!({"type": "unknown"})),
            record(json!({"type": "status", "value": "x"})),
            record(json!({"type": "Persona", "name": "two"})),
        ];
        let kinds: Vec<RecordKind> = in_processing_order(&records)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::Persona,
                RecordKind::Persona,
                RecordKind::Sms,
                RecordKind::Status
            ]
        );
    }

    #[test]
    fn random_sms_persona_creates_or_augments_the_message() {
        let mut shared = SharedFields::default();
        shared.absorb(
            RecordKind::RandomSmsPersona,
            &json!({"type": "randomSmsPersona", "name": "快递员"}),
        );
        let sms = shared.random_sms.as_ref().unwrap();
        assert_eq!(sms.content, "");
        assert_eq!(sms.persona.as_ref().unwrap().name, "快递员");

        shared.absorb(
            RecordKind::RandomSms,
            &json!({"sms_type": "ad", "number": "10086", "message": "流量包优惠"}),
        );
        let sms = shared.random_sms.as_ref().unwrap();
        assert_eq!(sms.sms_type, "ad");
        assert_eq!(sms.sender_number, "10086");
        assert_eq!(sms.content, "流量包优惠");
        // a fresh randomSms replaces the earlier stub
        assert!(sms.persona.is_none());
    }

    #[test]
    fn shared_fields_notes_status_unblock() {
        let mut shared = SharedFields::default();
        assert!(shared.is_empty());
        shared.absorb(RecordKind::Notes, &json!({"items": ["喜欢猫", "讨厌下雨；怕黑"]}));
        shared.absorb(RecordKind::Notes, &json!({"note": "只剩这一条"}));
        shared.absorb(RecordKind::Status, &json!({"status": "   "}));
        shared.absorb(RecordKind::UnblockUser, &json!({"approved": "maybe"}));
        assert_eq!(
            shared.notes,
            Some(vec![NoteItem {
                content: "只剩这一条".into()
            }])
        );
        assert!(shared.status.is_none());
        assert!(shared.unblock_user.is_none());

        shared.absorb(RecordKind::UnblockUser, &json!({"decision": "skip"}));
        assert_eq!(shared.unblock_user, Some(false));
        assert!(!shared.absorb(RecordKind::Call, &json!({})));
    }

    #[test]
    fn free_prose_interprets_to_none() {
        assert!(interpret("今天天气不错，我们明天见。", Surface::Call).is_none());
        assert!(interpret("今天天气不错，我们明天见。", Surface::Sms).is_none());
    }
}
