use ovocall_common::Error;

use crate::persona::PersonaProfile;
use crate::runtime::TurnFailure;
use crate::session::CharacterRef;
use crate::turn::{CallRequest, FriendRequest, InterferenceMessage, Surface};

/// UI-facing callbacks. Every method defaults to a no-op, so an embedder only
/// implements what it can display.
pub trait Notifier: Send + Sync {
    /// The model answered but nothing usable came out of it.
    fn turn_failed(&self, _surface: Surface, _failure: &TurnFailure) {}

    /// The provider call itself failed. Never called for caller aborts.
    fn provider_failed(&self, _surface: Surface, _error: &Error) {}

    /// A stranger's persona was adopted for the session.
    fn persona_resolved(&self, _surface: Surface, _phone_number: &str, _persona: &PersonaProfile) {}

    fn interference_received(&self, _sender_number: &str, _message: &InterferenceMessage) {}

    fn friend_request(&self, _character: &CharacterRef, _request: &FriendRequest) {}

    fn incoming_call_request(&self, _phone_number: &str, _request: &CallRequest) {}

    fn unblock_user(&self, _character: &CharacterRef) {}
}

/// Default notifier: drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}
