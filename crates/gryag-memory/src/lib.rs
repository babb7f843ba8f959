//! Unified fact store: per-user and per-chat knowledge with soft delete,
//! versioning, and value normalisation, plus derived profiles and the
//! system-prompt override store.

pub mod facts;
pub mod normalise;
pub mod profiles;
pub mod prompts;
pub mod types;

pub use facts::FactRepository;
pub use profiles::ProfileRepository;
pub use prompts::PromptStore;
pub use types::*;
