pub mod gemini;
pub mod hooks;
pub mod jsonl;
pub mod openai;
pub mod persona;
pub mod prompt;
pub mod providers;
pub mod runtime;
pub mod session;
pub mod text;
pub mod turn;

pub use gemini::GeminiProvider;
pub use hooks::{NoopNotifier, Notifier};
pub use jsonl::{Record, extract_records};
pub use openai::OpenAiProvider;
pub use persona::{PersonaProfile, SupplementEntry, Supplements, merge_supplement, normalize_persona};
pub use prompt::{Prompt, PromptBuilder, PromptContext, ProtocolPromptBuilder};
pub use providers::{
    ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse, Usage, build_provider,
    default_model,
};
pub use runtime::{TurnFailure, TurnOptions, TurnOutcome, TurnRuntime, TurnSettings};
pub use session::{
    CharacterRef, Counterpart, Session, SessionManager, SessionPhase, SessionSelector,
    SessionSnapshot,
};
pub use turn::{
    CallRequest, CallTurn, FriendRequest, InterferenceMessage, SmsTurn, Surface, TurnResult,
    interpret,
};
