pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{HistoryEntry, HistoryRole};
pub use types::{is_mobile_number, normalize_id, session_key};
