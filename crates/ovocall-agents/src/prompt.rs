//! Request assembly. Narrative prompt content lives with the embedder; the default
//! builder only states the output protocol and the facts the core knows.

use crate::persona::{PersonaProfile, render_supplements};
use crate::providers::ChatMessage;
use crate::session::{Counterpart, SessionSnapshot};
use crate::turn::Surface;
use ovocall_common::HistoryRole;

const AUTO_REPLY_NUDGE: &str = "(The user has not replied yet. Continue on your own.)";

/// Inputs for one turn's request.
pub struct PromptContext<'a> {
    pub session: &'a SessionSnapshot,
    /// Whether this turn may inject an interference message.
    pub invite_interference: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
}

pub trait PromptBuilder: Send + Sync {
    fn build(&self, ctx: &PromptContext<'_>) -> Prompt;
}

/// Minimal builder: protocol instructions, counterpart facts, then the history.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolPromptBuilder;

impl ProtocolPromptBuilder {
    fn protocol(surface: Surface) -> &'static str {
        match surface {
            Surface::Call => {
                "Reply in JSONL only, one object per line.\n\
                 {\"type\":\"call\",\"sentence\":\"...\"} one line per spoken sentence, at least one.\n\
                 {\"type\":\"hangup\",\"value\":false} true to end the call.\n\
                 Optional: notes, status, personaSupplement, unblockUser."
            }
            Surface::Sms => {
                "Reply in JSONL only, one object per line.\n\
                 {\"type\":\"sms\",\"message\":\"...\"} one line per text message, at least one.\n\
                 Optional: notes, status, personaSupplement, unblockUser, friendRequest, callRequest."
            }
        }
    }

    fn describe_persona(persona: &PersonaProfile) -> String {
        let mut out = format!(
            "You are {} ({}, {}), phone {}.",
            persona.name, persona.gender, persona.age, persona.phone_number
        );
        for (label, value) in [
            ("Profession", &persona.profession),
            ("Personality", &persona.public_personality),
            ("Speech style", &persona.speech_style),
            ("Background", &persona.background),
        ] {
            if !value.is_empty() {
                out.push_str(&format!("\n{label}: {value}"));
            }
        }
        let supplements = render_supplements(persona);
        if !supplements.is_empty() {
            out.push_str("\nKnown details:\n");
            out.push_str(&supplements);
        }
        out
    }
}

impl PromptBuilder for ProtocolPromptBuilder {
    fn build(&self, ctx: &PromptContext<'_>) -> Prompt {
        let session = ctx.session;
        let mut system = vec![Self::protocol(session.surface).to_string()];

        match (&session.counterpart, &session.persona) {
            (_, Some(persona)) => system.push(Self::describe_persona(persona)),
            (Some(Counterpart::Character(character)), None) => {
                system.push(format!("You are {}.", character.name));
            }
            _ => system.push(
                "You are a stranger. Before anything else emit \
                 {\"type\":\"persona\",\"name\":\"...\",\"phoneNumber\":\"...\"} describing yourself."
                    .to_string(),
            ),
        }

        if ctx.invite_interference {
            system.push(
                "You may add one {\"type\":\"randomSms\",\"senderNumber\":\"...\",\"senderName\":\"...\",\"content\":\"...\"} \
                 from an unrelated sender."
                    .to_string(),
            );
        }

        let mut messages: Vec<ChatMessage> = session
            .history
            .iter()
            .map(|entry| match entry.role {
                HistoryRole::User => ChatMessage::user(entry.content.clone()),
                HistoryRole::Assistant => ChatMessage::assistant(entry.content.clone()),
            })
            .collect();

        // auto-reply: the counterpart speaks without new user input
        if session
            .history
            .last()
            .is_none_or(|entry| entry.role == HistoryRole::Assistant)
        {
            messages.push(ChatMessage::user(AUTO_REPLY_NUDGE));
        }

        Prompt {
            system: Some(system.join("\n\n")),
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CharacterRef, SessionPhase};
    use ovocall_common::HistoryEntry;

    fn snapshot(counterpart: Option<Counterpart>, persona: Option<PersonaProfile>) -> SessionSnapshot {
        SessionSnapshot {
            key: "13800000000".into(),
            surface: Surface::Sms,
            phone_number: "13800000000".into(),
            counterpart,
            persona,
            history: vec![HistoryEntry::user("在吗"), HistoryEntry::assistant("在")],
            phase: SessionPhase::Active,
            delay_pending: false,
        }
    }

    #[test]
    fn stranger_without_persona_is_asked_for_one() {
        let snap = snapshot(Some(Counterpart::Stranger), None);
        let prompt = ProtocolPromptBuilder.build(&PromptContext {
            session: &snap,
            invite_interference: false,
        });
        let system = prompt.system.unwrap();
        assert!(system.contains("\"type\":\"persona\""));
        assert!(!system.contains("randomSms"));
        assert_eq!(prompt.messages.len(), 3);
        assert_eq!(prompt.messages[1], ChatMessage::assistant("在"));
        assert_eq!(prompt.messages[2], ChatMessage::user(AUTO_REPLY_NUDGE));
    }

    #[test]
    fn pending_user_input_needs_no_nudge() {
        let mut snap = snapshot(Some(Counterpart::Stranger), None);
        snap.history.push(HistoryEntry::user("人呢"));
        let prompt = ProtocolPromptBuilder.build(&PromptContext {
            session: &snap,
            invite_interference: false,
        });
        assert_eq!(prompt.messages.last(), Some(&ChatMessage::user("人呢")));
    }

    #[test]
    fn persona_and_supplements_are_described() {
        let mut persona = PersonaProfile {
            name: "林晚".into(),
            ..Default::default()
        };
        persona.supplements.insert("宠物".into(), "橘猫".into());
        let snap = snapshot(
            Some(Counterpart::Character(CharacterRef {
                id: "c".into(),
                name: "ignored".into(),
            })),
            Some(persona),
        );
        let prompt = ProtocolPromptBuilder.build(&PromptContext {
            session: &snap,
            invite_interference: true,
        });
        let system = prompt.system.unwrap();
        assert!(system.contains("林晚"));
        assert!(system.contains("- 宠物：橘猫"));
        assert!(system.contains("randomSms"));
    }
}
