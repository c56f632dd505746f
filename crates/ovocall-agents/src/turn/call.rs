use serde::Serialize;

use super::{RecordKind, SharedFields, in_processing_order};
use crate::jsonl::Record;
use crate::text::{HANGUP, coerce_bool, collect_texts, first_present};

/// One turn on the call surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTurn {
    pub sentences: Vec<String>,
    pub hangup: Option<bool>,
    #[serde(flatten)]
    pub shared: SharedFields,
}

impl CallTurn {
    /// Nothing usable: no sentence, no hang-up request, no shared field. An explicit
    /// "keep talking" alone does not count.
    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty() && self.hangup != Some(true) && self.shared.is_empty()
    }

    pub fn wants_hangup(&self) -> bool {
        self.hangup == Some(true)
    }
}

pub fn interpret_call(records: &[Record]) -> Option<CallTurn> {
    let mut turn = CallTurn::default();

    for (kind, record) in in_processing_order(records) {
        match kind {
            RecordKind::Call => {
                collect_texts(
                    first_present(
                        &record,
                        &["sentence", "sentences", "message", "messages", "content", "text"],
                    ),
                    &mut turn.sentences,
                );
                if let Some(decision) =
                    coerce_bool(first_present(&record, &["hangup", "end", "value"]), HANGUP)
                {
                    turn.hangup = Some(decision);
                }
            }
            RecordKind::Hangup => {
                if let Some(decision) =
                    coerce_bool(first_present(&record, &["value", "hangup", "end"]), HANGUP)
                {
                    turn.hangup = Some(decision);
                }
            }
            other => {
                turn.shared.absorb(other, &record);
            }
        }
    }

    if turn.is_empty() { None } else { Some(turn) }
}
