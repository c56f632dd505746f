use std::sync::Arc;
use std::time::Duration;

use ovocall_common::{Error, HistoryEntry, Result, is_mobile_number, normalize_id, session_key};
use ovocall_config::AppConfig;
use ovocall_db::{MemoryRecordStore, RecordStore, tables};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::hooks::{NoopNotifier, Notifier};
use crate::jsonl::extract_records;
use crate::persona::{PersonaProfile, merge_supplement, resolve_phone_number};
use crate::prompt::{Prompt, PromptBuilder, PromptContext, ProtocolPromptBuilder};
use crate::providers::{LlmProvider, LlmRequest, default_model};
use crate::session::{
    CharacterRef, Counterpart, RequestTicket, Session, SessionManager, SessionSelector,
};
use crate::turn::{InterferenceMessage, Surface, TurnResult, interpret_records};

/// Mobile prefixes used when an interference sender has no number.
const SENDER_PREFIXES: [&str; 15] = [
    "138", "139", "150", "151", "152", "158", "159", "186", "188", "189", "135", "136", "137",
    "180", "181",
];

const STRANGER_NAME: &str = "陌生人";
const DEFAULT_FRIEND_REASON: &str = "你好，想加你为好友";
const UNKNOWN_PROFESSION: &str = "未知";

const CALL_TEST_REPLIES: [&[&str]; 4] = [
    &["喂？怎么啦？", "嗯，我在听呢", "你说吧~"],
    &["哈哈，你这个主意不错啊！", "我觉得可以试试"],
    &["嗯", "好的", "知道了"],
    &["诶，你在干嘛呢？我这边有点吵，在外面呢"],
];

const SMS_TEST_REPLIES: [&[&str]; 4] = [
    &["好的，收到了！", "你那边怎么样？"],
    &["哈哈，有意思", "改天聊"],
    &["嗯嗯，知道了"],
    &["？？？", "你是谁啊", "打错了吧"],
];

/// Why a turn produced nothing, when the provider itself succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnFailure {
    /// No record could be recovered from the output.
    NoRecords,
    /// Records were found but none populated a recognized field.
    Empty,
    /// The turn carried no sentence or message to show.
    MissingReply,
}

impl std::fmt::Display for TurnFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TurnFailure::NoRecords => "no structured records in model output",
            TurnFailure::Empty => "model output had no usable fields",
            TurnFailure::MissingReply => "model output had no reply lines",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(TurnResult),
    /// The caller aborted the request. Not an error and not reported.
    Cancelled,
    Failed(TurnFailure),
}

impl TurnOutcome {
    pub fn result(&self) -> Option<&TurnResult> {
        match self {
            TurnOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }
}

/// Per-send context the embedding UI knows about.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// The bound character has blocked the user; `unblockUser` is honored.
    pub blocked_by_character: bool,
    /// The bound character may send the user a friend request.
    pub allow_friend_request: bool,
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub random_sms_probability: f64,
    pub test_mode: bool,
    pub call_test_delay: Duration,
    pub sms_test_delay: Duration,
}

impl TurnSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let provider = &config.provider;
        let turn = &config.turn;
        Self {
            model: provider
                .model
                .clone()
                .unwrap_or_else(|| default_model(provider.kind).to_string()),
            temperature: turn.temperature,
            max_tokens: provider.resolved_max_output_tokens(),
            random_sms_probability: turn.random_sms_probability,
            test_mode: turn.test_mode,
            call_test_delay: Duration::from_millis(turn.call_test_delay_ms),
            sms_test_delay: Duration::from_millis(turn.sms_test_delay_ms),
        }
    }

    /// `random_sms_probability` held to `[0, 1]`; NaN counts as never.
    fn interference_probability(&self) -> f64 {
        let p = self.random_sms_probability;
        if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
    }

    fn test_delay(&self, surface: Surface) -> Duration {
        match surface {
            Surface::Call => self.call_test_delay,
            Surface::Sms => self.sms_test_delay,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Drives turns for the call and SMS sessions: builds the request, calls the
/// provider, interprets the output and applies it.
pub struct TurnRuntime {
    provider: Option<Arc<dyn LlmProvider>>,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    prompts: Arc<dyn PromptBuilder>,
    sessions: SessionManager,
    settings: TurnSettings,
}

impl TurnRuntime {
    /// A runtime with an in-memory store, no notifications and the protocol-only
    /// prompt builder. `provider` may be `None` in test mode.
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, settings: TurnSettings) -> Self {
        Self {
            provider,
            store: Arc::new(MemoryRecordStore::new()),
            notifier: Arc::new(NoopNotifier),
            prompts: Arc::new(ProtocolPromptBuilder),
            sessions: SessionManager::new(),
            settings,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ── call surface ────────────────────────────────────────────────────

    /// Start a new call, replacing (and aborting) the current one.
    pub fn start_call(&self, phone_number: &str, counterpart: Counterpart) -> Arc<Session> {
        let phone = normalize_id(phone_number);
        info!(phone = %phone, "starting call");
        self.sessions.replace_call(&phone, counterpart)
    }

    /// Start a call to a number from contacts: a saved stranger persona is restored,
    /// otherwise the callee is a fresh stranger.
    pub async fn start_call_from_contacts(&self, phone_number: &str) -> Arc<Session> {
        let phone = normalize_id(phone_number);
        let counterpart = match self.saved_stranger_persona(&phone).await {
            Some(persona) => Counterpart::SavedStranger { persona },
            None => Counterpart::Stranger,
        };
        self.start_call(&phone, counterpart)
    }

    #[instrument(skip(self, options), fields(surface = "call"))]
    pub async fn send_call_message(&self, text: &str, options: &TurnOptions) -> Result<TurnOutcome> {
        let session = self.sessions.call();
        let text = text.trim();
        if !text.is_empty() {
            session.append_history([HistoryEntry::user(text)]);
        }
        self.run_turn(&session, options).await
    }

    pub fn abort_call(&self) -> bool {
        self.sessions.call().abort()
    }

    pub fn end_call(&self) {
        self.sessions.call().end();
    }

    // ── SMS surface ─────────────────────────────────────────────────────

    /// Open the SMS thread for `phone_number`. An existing thread is reused unless
    /// `force` is set, in which case it is aborted and replaced with empty history.
    pub fn open_sms(
        &self,
        phone_number: &str,
        counterpart: Counterpart,
        force: bool,
    ) -> Result<Arc<Session>> {
        let key = session_key(phone_number)
            .ok_or_else(|| Error::Session(format!("invalid SMS number '{phone_number}'")))?;

        if !force {
            if let Some(existing) = self.sessions.get_sms(&key) {
                self.sessions.set_active_sms(Some(&key));
                return Ok(existing);
            }
        }
        info!(session = %key, force, "opening SMS session");
        Ok(self.sessions.replace_sms(&key, &key, counterpart))
    }

    /// Append the user's messages (timestamps as given) and run one turn.
    #[instrument(skip_all, fields(surface = "sms"))]
    pub async fn send_sms_messages(
        &self,
        selector: &SessionSelector,
        messages: Vec<HistoryEntry>,
        options: &TurnOptions,
    ) -> Result<TurnOutcome> {
        let session = self.resolve_sms(selector)?;
        session.append_history(messages.into_iter().filter(|m| !m.content.trim().is_empty()));
        self.run_turn(&session, options).await
    }

    pub async fn send_sms_message(
        &self,
        selector: &SessionSelector,
        text: &str,
        options: &TurnOptions,
    ) -> Result<TurnOutcome> {
        self.send_sms_messages(selector, vec![HistoryEntry::user(text.trim())], options)
            .await
    }

    /// Let the counterpart write first, without new user input.
    pub async fn sms_auto_reply(
        &self,
        selector: &SessionSelector,
        options: &TurnOptions,
    ) -> Result<TurnOutcome> {
        let session = self.resolve_sms(selector)?;
        self.run_turn(&session, options).await
    }

    pub fn abort_sms(&self, selector: &SessionSelector) -> bool {
        self.sessions
            .resolve_sms(selector)
            .is_some_and(|session| session.abort())
    }

    /// End an SMS thread; `remove` also drops it from the session collection.
    pub fn end_sms(&self, selector: &SessionSelector, remove: bool) {
        let Some(session) = self.sessions.resolve_sms(selector) else {
            return;
        };
        session.end();
        if remove {
            self.sessions.remove_sms(session.key());
        }
    }

    fn resolve_sms(&self, selector: &SessionSelector) -> Result<Arc<Session>> {
        self.sessions
            .resolve_sms(selector)
            .ok_or_else(|| Error::Session("no SMS session to send to".to_string()))
    }

    // ── turn pipeline ───────────────────────────────────────────────────

    async fn run_turn(&self, session: &Arc<Session>, options: &TurnOptions) -> Result<TurnOutcome> {
        let surface = session.surface();
        let guard = session.guard_request();
        let ticket = guard.ticket().clone();
        let snapshot = session.snapshot();

        let invite_interference = rand::rng().random_bool(self.settings.interference_probability());
        let prompt = self.prompts.build(&PromptContext {
            session: &snapshot,
            invite_interference,
        });
        debug!(session = %session.key(), invite_interference, "prompt built");

        let raw = tokio::select! {
            _ = ticket.token.cancelled() => Err(Error::Cancelled),
            raw = self.fetch(session, surface, prompt) => raw,
        };
        drop(guard);

        let raw = match raw {
            Ok(_) if ticket.token.is_cancelled() => return Ok(self.cancelled(session)),
            Ok(raw) => raw,
            Err(e) if e.is_cancelled() => return Ok(self.cancelled(session)),
            Err(e) => {
                warn!(session = %session.key(), "completion failed: {e}");
                self.notifier.provider_failed(surface, &e);
                return Err(e);
            }
        };
        debug!(session = %session.key(), raw = %raw, "model output");

        let result = match self.interpret(&raw, surface) {
            Ok(result) => result,
            Err(failure) => {
                warn!(session = %session.key(), surface = ?surface, "turn failed: {failure}");
                self.notifier.turn_failed(surface, &failure);
                return Ok(TurnOutcome::Failed(failure));
            }
        };

        self.apply(session, &ticket, &result, options).await;
        Ok(TurnOutcome::Completed(result))
    }

    fn cancelled(&self, session: &Session) -> TurnOutcome {
        info!(session = %session.key(), "turn cancelled by caller");
        TurnOutcome::Cancelled
    }

    async fn fetch(
        &self,
        session: &Session,
        surface: Surface,
        prompt: Prompt,
    ) -> Result<String> {
        if self.settings.test_mode {
            session.set_delay_pending(true);
            tokio::time::sleep(self.settings.test_delay(surface)).await;
            session.set_delay_pending(false);
            return Ok(canned_reply(surface));
        }

        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| Error::Agent("no completion provider configured".to_string()))?;

        let request = LlmRequest {
            model: self.settings.model.clone(),
            messages: prompt.messages,
            system: prompt.system,
            max_tokens: Some(self.settings.max_tokens),
            temperature: Some(self.settings.temperature),
        };
        let response = provider.complete(&request).await?;
        Ok(response.content)
    }

    fn interpret(&self, raw: &str, surface: Surface) -> std::result::Result<TurnResult, TurnFailure> {
        let records = extract_records(raw);
        if records.is_empty() {
            return Err(TurnFailure::NoRecords);
        }
        let result = interpret_records(&records, surface).ok_or(TurnFailure::Empty)?;
        if result.reply_lines().is_empty() {
            return Err(TurnFailure::MissingReply);
        }
        Ok(result)
    }

    /// Apply a successful turn to the session and collaborators. Store writes are
    /// best effort.
    async fn apply(
        &self,
        session: &Session,
        ticket: &RequestTicket,
        result: &TurnResult,
        options: &TurnOptions,
    ) {
        let surface = session.surface();
        let shared = result.shared();
        let (counterpart, phone_before) = {
            let state = session.lock();
            (state.counterpart.clone(), state.phone_number.clone())
        };
        let is_stranger = counterpart.as_ref().is_some_and(Counterpart::is_stranger);
        let character = counterpart.as_ref().and_then(Counterpart::character).cloned();

        // 1. adopt the stranger's persona once
        if is_stranger {
            if let Some(incoming) = &shared.persona {
                if let Some((phone, persona)) = self.adopt_persona(session, incoming) {
                    info!(session = %session.key(), phone = %phone, name = %persona.name, "stranger persona adopted");
                    self.save_stranger_contact(&phone, &persona).await;
                    self.notifier.persona_resolved(surface, &phone, &persona);
                }
            }
        }

        // 2. fold supplements into it
        if is_stranger {
            if let Some(entries) = &shared.persona_supplement {
                let merged = {
                    let mut state = session.lock();
                    let merged = state
                        .persona
                        .as_ref()
                        .and_then(|persona| match merge_supplement(persona, entries) {
                            std::borrow::Cow::Owned(p) => Some(p),
                            std::borrow::Cow::Borrowed(_) => None,
                        });
                    if let Some(persona) = &merged {
                        state.persona = Some(persona.clone());
                    }
                    let phone = state.phone_number.clone();
                    merged.map(|p| (phone, p))
                };
                if let Some((phone, persona)) = merged {
                    debug!(session = %session.key(), count = entries.len(), "persona supplemented");
                    self.save_stranger_contact(&phone, &persona).await;
                }
            }
        }

        // 3. reply into history
        match result {
            TurnResult::Call(turn) => {
                session.append_history([HistoryEntry::assistant(turn.sentences.concat())]);
            }
            TurnResult::Sms(turn) => {
                session.append_history(turn.messages.iter().map(HistoryEntry::assistant));
            }
        }

        // 4. interference message
        if let Some(message) = shared.random_sms.as_ref().filter(|m| !m.content.is_empty()) {
            let sender = self.save_interference(message).await;
            self.notifier.interference_received(&sender, message);
        }

        // 5. bound-character bookkeeping
        if let Some(character) = &character {
            if let Some(notes) = &shared.notes {
                for note in notes {
                    let record = json!({
                        "characterId": character.id,
                        "sessionId": session.key(),
                        "profileId": options.profile_id,
                        "content": note.content,
                        "color": "yellow",
                        "createdAt": chrono::Utc::now().to_rfc3339(),
                    });
                    if let Err(e) = self.store.add(tables::CHARACTER_NOTES, record).await {
                        warn!("failed to save character note: {e}");
                    }
                }
            }
            if let Some(status) = &shared.status {
                let record = json!({
                    "characterId": character.id,
                    "sessionId": session.key(),
                    "profileId": options.profile_id,
                    "status": status,
                    "updatedAt": chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = self
                    .store
                    .put(tables::CHARACTER_STATUS, &character.id, record)
                    .await
                {
                    warn!("failed to save character status: {e}");
                }
            }
        }

        // 6. unblock
        if shared.unblock_user == Some(true) && options.blocked_by_character {
            if let Some(character) = &character {
                info!(character = %character.id, "character unblocks the user");
                self.notifier.unblock_user(character);
            }
        }

        if let TurnResult::Sms(turn) = result {
            // 7. friend request
            if let (Some(request), Some(character)) = (&turn.friend_request, &character) {
                if options.allow_friend_request {
                    let mut request = request.clone();
                    if request.reason.is_empty() {
                        request.reason = DEFAULT_FRIEND_REASON.to_string();
                    }
                    self.save_friend_request(character, &phone_before, &request.reason)
                        .await;
                    self.notifier.friend_request(character, &request);
                }
            }
            // 8. incoming call request
            if let Some(request) = &turn.call_request {
                let phone = session.lock().phone_number.clone();
                self.notifier.incoming_call_request(&phone, request);
            }
        }

        debug!(session = %session.key(), generation = ticket.generation, "turn applied");
    }

    /// Install `incoming` as the session persona if it has none. Returns the resolved
    /// phone number and the adopted persona.
    fn adopt_persona(
        &self,
        session: &Session,
        incoming: &PersonaProfile,
    ) -> Option<(String, PersonaProfile)> {
        let mut state = session.lock();
        if state.persona.is_some() {
            return None;
        }

        let phone = if is_mobile_number(&state.phone_number) {
            state.phone_number.clone()
        } else {
            resolve_phone_number(&incoming.phone_number, &mut rand::rng())
        };
        if !is_mobile_number(&state.phone_number) {
            state.phone_number = phone.clone();
        }

        let mut persona = incoming.clone();
        persona.phone_number = phone.clone();
        if persona.name.is_empty() {
            persona.name = STRANGER_NAME.to_string();
        }
        if persona.profession.is_empty() {
            persona.profession = UNKNOWN_PROFESSION.to_string();
        }
        state.persona = Some(persona.clone());
        Some((phone, persona))
    }

    /// The stranger persona stored for `phone` in contacts, if any.
    pub async fn saved_stranger_persona(&self, phone: &str) -> Option<PersonaProfile> {
        let contact = match self.store.get(tables::CONTACTS, phone).await {
            Ok(contact) => contact?,
            Err(e) => {
                warn!("failed to look up contact {phone}: {e}");
                return None;
            }
        };
        let raw = contact.get("strangerPersona").filter(|v| v.is_object())?;
        match serde_json::from_value::<PersonaProfile>(raw.clone()) {
            Ok(mut persona) => {
                if !is_mobile_number(&persona.phone_number) {
                    persona.phone_number = phone.to_string();
                }
                Some(persona)
            }
            Err(e) => {
                warn!("ignoring unreadable stranger persona for {phone}: {e}");
                None
            }
        }
    }

    async fn save_stranger_contact(&self, phone: &str, persona: &PersonaProfile) {
        let record = json!({
            "phoneNumber": phone,
            "name": persona.name,
            "isStranger": true,
            "strangerPersona": persona,
            "updatedAt": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.store.put(tables::CONTACTS, phone, record).await {
            warn!("failed to save stranger contact {phone}: {e}");
        }
    }

    /// Persist an interference SMS and its sender. Returns the sender number used.
    async fn save_interference(&self, message: &InterferenceMessage) -> String {
        let sender = Some(normalize_id(&message.sender_number))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| random_sender_number(&mut rand::rng()));

        let sms_type = if message.sms_type.is_empty() {
            "spam"
        } else {
            message.sms_type.as_str()
        };
        let record = json!({
            "characterId": Value::Null,
            "sessionId": format!("sms_{sender}"),
            "phoneNumber": sender,
            "role": "assistant",
            "type": "sms",
            "content": message.content,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "isRandomSms": true,
            "randomSmsType": sms_type,
            "senderName": message.sender_name,
            "randomSmsPersona": message.persona,
        });
        match self.store.add(tables::CHAT_MESSAGES, record).await {
            Ok(id) => debug!(id = %id, sender = %sender, "interference SMS saved"),
            Err(e) => warn!("failed to save interference SMS from {sender}: {e}"),
        }

        if let Err(e) = self.save_interference_contact(&sender, message).await {
            warn!("failed to save interference contact {sender}: {e}");
        }
        sender
    }

    async fn save_interference_contact(&self, sender: &str, message: &InterferenceMessage) -> Result<()> {
        let existing = self.store.get(tables::CONTACTS, sender).await?;
        if let Some(contact) = &existing {
            let owned = ["characterId", "isUserSavedContact"]
                .iter()
                .any(|k| contact.get(*k).is_some_and(crate::text::is_truthy));
            if owned {
                return Ok(());
            }
        }

        let persona_name = message.persona.as_ref().map(|p| p.name.clone()).filter(|n| !n.is_empty());
        let name = persona_name
            .clone()
            .or_else(|| Some(message.sender_name.clone()).filter(|n| !n.is_empty()))
            .unwrap_or_else(|| sender.to_string());
        let stranger_persona = existing
            .as_ref()
            .and_then(|c| c.get("strangerPersona").filter(|v| v.is_object()).cloned())
            .or_else(|| message.persona.as_ref().and_then(|p| serde_json::to_value(p).ok()));

        let record = json!({
            "phoneNumber": sender,
            "name": name,
            "isRandomSms": true,
            "strangerPersona": stranger_persona,
            "updatedAt": chrono::Utc::now().to_rfc3339(),
        });
        self.store.put(tables::CONTACTS, sender, record).await
    }

    async fn save_friend_request(&self, character: &CharacterRef, phone: &str, reason: &str) {
        let record = json!({
            "characterId": character.id,
            "characterName": character.name,
            "phoneNumber": phone,
            "reason": reason,
            "status": "pending",
            "createdAt": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.store.add(tables::FRIEND_REQUESTS, record).await {
            warn!("failed to save friend request from {}: {e}", character.id);
        }
    }
}

/// An 11-digit number with a common mobile prefix.
pub fn random_sender_number<R: Rng>(rng: &mut R) -> String {
    let prefix = SENDER_PREFIXES.choose(rng).copied().unwrap_or("138");
    format!("{prefix}{:08}", rng.random_range(0..100_000_000u32))
}

fn canned_reply(surface: Surface) -> String {
    let mut rng = rand::rng();
    let (lines, kind, field) = match surface {
        Surface::Call => (CALL_TEST_REPLIES.choose(&mut rng), "call", "sentence"),
        Surface::Sms => (SMS_TEST_REPLIES.choose(&mut rng), "sms", "message"),
    };
    let mut out: Vec<String> = lines
        .copied()
        .unwrap_or_default()
        .iter()
        .map(|line| json!({"type": kind, field: line}).to_string())
        .collect();
    if surface == Surface::Call {
        out.push(json!({"type": "hangup", "value": false}).to_string());
    }
    out.join("\n")
}
