//! # llama-engine
//!
//! The "narrow waist" of the llama-chat stack. Defines the [`LlamaEngine`] trait
//! for a decoding context and the [`EngineBackend`] trait that creates one, plus
//! the value types that cross that boundary ([`Batch`], [`ChatTurn`], [`TokenId`]).
//! Concrete backends (llama.cpp FFI, a remote worker, the reference mock) plug in
//! behind these traits without changing the session layer.
//!
//! ## Design Notes
//!
//! ### Exclusive Access
//! `LlamaEngine` methods that touch the KV cache take `&mut self`. One context
//! belongs to exactly one session; cache position bookkeeping is per-context,
//! so sharing a context between sessions is never correct. Run several
//! sessions by creating several contexts.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative. Positions and sequence IDs follow the same convention.

mod batch;

pub use batch::{Batch, BatchEntry, BatchError};

use std::fmt;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Position of a token inside the context window.
pub type Pos = i32;

/// Sequence identifier inside a batch.
pub type SeqId = i32;

/// Errors reported by an engine backend.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),
    #[error("context creation failed: {0}")]
    Context(String),
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// One immutable turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Specification for loading a model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub path: String,
}

/// Opaque handle to a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
    pub id: u64,
}

/// Parameters for creating a decoding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window size in cache cells.
    pub window_size: usize,
    /// Threads used for the forward pass and for batch processing.
    pub n_threads: usize,
}

impl ContextParams {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            n_threads: default_threads(),
        }
    }
}

/// Thread count for a context: two cores are left for the host, capped at 8.
pub fn default_threads() -> usize {
    let online = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    online.saturating_sub(2).clamp(1, 8)
}

/// Loads models and creates decoding contexts for them.
pub trait EngineBackend {
    type Engine: LlamaEngine;

    /// Load a model from disk given a specification.
    fn load_model(&self, spec: &ModelSpec) -> Result<ModelHandle>;

    /// Create a decoding context (with its own KV cache) for a loaded model.
    fn create_context(&self, model: &ModelHandle, params: &ContextParams) -> Result<Self::Engine>;
}

/// A decoding context: tokenizer, chat template, KV cache and sampler of one model.
///
/// Everything behind this trait is opaque to the session layer. The session only
/// relies on the contracts documented per method.
pub trait LlamaEngine {
    /// Convert text into token IDs. `add_special` prepends the model's BOS token;
    /// `parse_special` recognises special-token markup in `text`.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of one token. A fragment may end in the middle of a UTF-8 sequence.
    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>>;

    /// Render `turns` through the model's chat template into `buf`.
    ///
    /// Returns the full rendered length in bytes. A value larger than `buf.len()`
    /// means the output was truncated and the caller must resize and call again.
    /// A negative value reports that the template could not be applied.
    fn apply_chat_template(&self, turns: &[ChatTurn], add_assistant: bool, buf: &mut [u8]) -> i32;

    /// Run the forward pass over `batch`, appending its tokens to the KV cache.
    /// Logits are produced only for entries that request them.
    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Sample the next token from the logits of the last decoded batch.
    fn sample(&mut self) -> Result<TokenId>;

    /// Whether `token` ends generation (EOS, EOT and similar).
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Number of occupied KV cache cells.
    fn used_cells(&self) -> usize;

    /// Context window size in cells.
    fn capacity(&self) -> usize;

    /// Drop all KV cache contents.
    fn clear_cache(&mut self);
}

impl<E: LlamaEngine + ?Sized> LlamaEngine for Box<E> {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        (**self).tokenize(text, add_special, parse_special)
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>> {
        (**self).detokenize(token)
    }

    fn apply_chat_template(&self, turns: &[ChatTurn], add_assistant: bool, buf: &mut [u8]) -> i32 {
        (**self).apply_chat_template(turns, add_assistant, buf)
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        (**self).decode(batch)
    }

    fn sample(&mut self) -> Result<TokenId> {
        (**self).sample()
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        (**self).is_end_of_generation(token)
    }

    fn used_cells(&self) -> usize {
        (**self).used_cells()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn clear_cache(&mut self) {
        (**self).clear_cache()
    }
}
