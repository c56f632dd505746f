//! Conversation sessions: the singleton call and any number of keyed SMS threads.
//!
//! Each session owns its history, resolved persona and the cancellation token of
//! its in-flight request. State sits behind a plain mutex that is never held
//! across an `.await`; the runtime copies what it needs out via [`Session::snapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ovocall_common::{HistoryEntry, session_key};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::persona::PersonaProfile;
use crate::turn::Surface;

/// Key used for the call session, which is not tied to a collection.
pub const CALL_SESSION_KEY: &str = "call";

/// A bound character from the user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRef {
    pub id: String,
    pub name: String,
}

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Counterpart {
    Character(CharacterRef),
    /// Unknown caller; the model writes a persona on the first turn.
    Stranger,
    /// A stranger met before, restored from contacts.
    SavedStranger { persona: PersonaProfile },
}

impl Counterpart {
    pub fn is_stranger(&self) -> bool {
        !matches!(self, Counterpart::Character(_))
    }

    pub fn character(&self) -> Option<&CharacterRef> {
        match self {
            Counterpart::Character(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Active,
    RequestInFlight,
    Ended,
}

/// Handle for one in-flight request. Only the ticket with the current generation
/// may clear the session's request slot.
#[derive(Debug, Clone)]
pub struct RequestTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub phone_number: String,
    pub counterpart: Option<Counterpart>,
    pub persona: Option<PersonaProfile>,
    pub history: Vec<HistoryEntry>,
    request: Option<RequestTicket>,
    generation: u64,
    delay_pending: bool,
    ended: bool,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        if self.ended {
            SessionPhase::Ended
        } else if self.request.is_some() {
            SessionPhase::RequestInFlight
        } else if self.history.is_empty() && self.persona.is_none() {
            SessionPhase::Idle
        } else {
            SessionPhase::Active
        }
    }
}

/// Read-only copy of a session for prompt building and callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub key: String,
    pub surface: Surface,
    pub phone_number: String,
    pub counterpart: Option<Counterpart>,
    pub persona: Option<PersonaProfile>,
    pub history: Vec<HistoryEntry>,
    pub phase: SessionPhase,
    pub delay_pending: bool,
}

#[derive(Debug)]
pub struct Session {
    key: String,
    surface: Surface,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(key: impl Into<String>, surface: Surface) -> Self {
        Self {
            key: key.into(),
            surface,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub(crate) fn with_counterpart(
        key: impl Into<String>,
        surface: Surface,
        phone_number: &str,
        counterpart: Counterpart,
    ) -> Self {
        let session = Self::new(key, surface);
        {
            let mut state = session.lock();
            state.phone_number = phone_number.to_string();
            if let Counterpart::SavedStranger { persona } = &counterpart {
                state.persona = Some(persona.clone());
            }
            state.counterpart = Some(counterpart);
        }
        session
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    /// Lock the state. A poisoned lock still holds consistent data: every critical
    /// section is a handful of assignments.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().request.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            key: self.key.clone(),
            surface: self.surface,
            phone_number: state.phone_number.clone(),
            counterpart: state.counterpart.clone(),
            persona: state.persona.clone(),
            history: state.history.clone(),
            phase: state.phase(),
            delay_pending: state.delay_pending,
        }
    }

    pub fn append_history(&self, entries: impl IntoIterator<Item = HistoryEntry>) {
        self.lock().history.extend(entries);
    }

    /// Start a request with a fresh token. A still-pending request of this session
    /// is cancelled; other sessions are never touched.
    pub fn begin_request(&self) -> RequestTicket {
        let mut state = self.lock();
        if let Some(previous) = state.request.take() {
            debug!(session = %self.key, "superseding in-flight request");
            previous.token.cancel();
        }
        state.generation += 1;
        state.ended = false;
        let ticket = RequestTicket {
            generation: state.generation,
            token: CancellationToken::new(),
        };
        state.request = Some(ticket.clone());
        ticket
    }

    /// [`Session::begin_request`] whose slot is released when the guard drops, so a
    /// caller that drops the turn future does not leave the session busy.
    pub fn guard_request(&self) -> RequestGuard<'_> {
        RequestGuard {
            session: self,
            ticket: self.begin_request(),
        }
    }

    /// Release the request slot if `ticket` still owns it.
    pub fn finish_request(&self, ticket: &RequestTicket) {
        let mut state = self.lock();
        if state
            .request
            .as_ref()
            .is_some_and(|current| current.generation == ticket.generation)
        {
            state.request = None;
            state.delay_pending = false;
        }
    }

    pub fn set_delay_pending(&self, pending: bool) {
        self.lock().delay_pending = pending;
    }

    /// Cancel the in-flight request and any pending test delay. Returns whether
    /// anything was running. Idempotent.
    pub fn abort(&self) -> bool {
        let mut state = self.lock();
        state.delay_pending = false;
        match state.request.take() {
            Some(ticket) => {
                ticket.token.cancel();
                info!(session = %self.key, "request aborted");
                true
            }
            None => false,
        }
    }

    /// Abort, then forget the counterpart, persona and history.
    pub fn end(&self) {
        self.abort();
        let mut state = self.lock();
        state.counterpart = None;
        state.persona = None;
        state.history.clear();
        state.ended = true;
    }
}

/// Releases its request slot on drop unless a newer request took over.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    session: &'a Session,
    ticket: RequestTicket,
}

impl RequestGuard<'_> {
    pub fn ticket(&self) -> &RequestTicket {
        &self.ticket
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.session.finish_request(&self.ticket);
    }
}

/// How a caller names an SMS session.
#[derive(Debug, Clone)]
pub enum SessionSelector {
    Handle(Arc<Session>),
    /// A session key or a raw phone number; normalized before lookup.
    Key(String),
    /// Whichever SMS session is currently marked active.
    Active,
}

impl From<Arc<Session>> for SessionSelector {
    fn from(session: Arc<Session>) -> Self {
        SessionSelector::Handle(session)
    }
}

impl From<&str> for SessionSelector {
    fn from(key: &str) -> Self {
        SessionSelector::Key(key.to_string())
    }
}

/// Owns the call session and the keyed SMS sessions.
pub struct SessionManager {
    call: RwLock<Arc<Session>>,
    sms: RwLock<HashMap<String, Arc<Session>>>,
    active_sms: RwLock<Option<String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            call: RwLock::new(Arc::new(Session::new(CALL_SESSION_KEY, Surface::Call))),
            sms: RwLock::new(HashMap::new()),
            active_sms: RwLock::new(None),
        }
    }

    pub fn call(&self) -> Arc<Session> {
        self.call.read().unwrap().clone()
    }

    /// Replace the call session. The previous call's request is aborted.
    pub fn replace_call(&self, phone_number: &str, counterpart: Counterpart) -> Arc<Session> {
        let session = Arc::new(Session::with_counterpart(
            CALL_SESSION_KEY,
            Surface::Call,
            phone_number,
            counterpart,
        ));
        let previous = std::mem::replace(&mut *self.call.write().unwrap(), session.clone());
        previous.abort();
        session
    }

    /// Get or create the SMS session for `key` and mark it active.
    pub fn ensure_sms(&self, key: &str) -> Arc<Session> {
        let session = self
            .sms
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Session::new(key, Surface::Sms)))
            .clone();
        self.set_active_sms(Some(key));
        session
    }

    /// Install a fresh SMS session for `key`, aborting and dropping any previous one.
    pub fn replace_sms(
        &self,
        key: &str,
        phone_number: &str,
        counterpart: Counterpart,
    ) -> Arc<Session> {
        let session = Arc::new(Session::with_counterpart(
            key,
            Surface::Sms,
            phone_number,
            counterpart,
        ));
        let previous = self
            .sms
            .write()
            .unwrap()
            .insert(key.to_string(), session.clone());
        if let Some(previous) = previous {
            previous.abort();
        }
        self.set_active_sms(Some(key));
        session
    }

    pub fn get_sms(&self, key: &str) -> Option<Arc<Session>> {
        self.sms.read().unwrap().get(key).cloned()
    }

    /// Explicit handle first, then the normalized key. The active session is used
    /// only when no key can be derived; a key without a session resolves to nothing.
    pub fn resolve_sms(&self, selector: &SessionSelector) -> Option<Arc<Session>> {
        match selector {
            SessionSelector::Handle(session) => Some(session.clone()),
            SessionSelector::Key(raw) => match session_key(raw) {
                Some(key) => self.get_sms(&key),
                None => self.active_sms(),
            },
            SessionSelector::Active => self.active_sms(),
        }
    }

    pub fn remove_sms(&self, key: &str) -> Option<Arc<Session>> {
        let removed = self.sms.write().unwrap().remove(key);
        let mut active = self.active_sms.write().unwrap();
        if active.as_deref() == Some(key) {
            *active = None;
        }
        removed
    }

    pub fn set_active_sms(&self, key: Option<&str>) {
        *self.active_sms.write().unwrap() = key.map(str::to_string);
    }

    pub fn active_sms_key(&self) -> Option<String> {
        self.active_sms.read().unwrap().clone()
    }

    pub fn active_sms(&self) -> Option<Arc<Session>> {
        self.active_sms_key().and_then(|key| self.get_sms(&key))
    }

    pub fn sms_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sms.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
