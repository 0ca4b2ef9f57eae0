//! Incremental chat completion over a llama.cpp-style engine.
//!
//! The engine is an opaque capability ([`llama_engine::LlamaEngine`]); this
//! crate decides how each new prompt reaches its KV cache. A warm cache gets
//! only the newest user turn appended, everything else is re-decoded from
//! scratch, and a prompt that would not leave room for the reply is rejected
//! instead of truncated. Generated bytes are reassembled into complete UTF-8
//! text before they reach the caller.

pub mod batch;
pub mod config;
pub mod error;
pub mod planner;
pub mod prompt;
pub mod session;
pub mod state;
pub mod transcript;

pub use batch::{BatchBuilder, LogitsMode};
pub use config::{load_config, SessionConfig};
pub use error::{ChatError, EngineOp, Result};
pub use planner::{Decision, IncrementalPlanner, PlanMode, RejectReason};
pub use prompt::{BoundaryLocator, PromptFormatter, RenderedPrompt, RoleMarker};
pub use session::{CompletionSession, FinishReason, Phase, StepOutput};
pub use state::SessionState;
pub use transcript::{load_transcript, parse_transcript, RawTurn};

pub use llama_engine::{ChatTurn, LlamaEngine, Role};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
