//! Session configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty object `{}`
//! is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use llama_engine::SeqId;

use crate::error::{ChatError, Result};

/// Configuration for a [`CompletionSession`](crate::CompletionSession).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// KV cache window in cells. Must not exceed the engine context.
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Tokens per decode batch. Defaults to `context_size` so a full-window
    /// prompt always fits in one batch.
    #[serde(default)]
    pub batch_capacity: Option<usize>,

    /// Maximum sequence ids per batch entry.
    #[serde(default = "default_max_sequences")]
    pub max_sequences: usize,

    /// Sequence every entry is tagged with.
    #[serde(default)]
    pub sequence_id: SeqId,

    /// Text that marks the assistant-generation cue in rendered templates.
    #[serde(default = "default_assistant_marker")]
    pub assistant_marker: String,

    /// Initial buffer for rendering a single incremental turn.
    #[serde(default = "default_template_buffer_bytes")]
    pub template_buffer_bytes: usize,

    /// Add BOS/special prefix tokens to incremental segments.
    #[serde(default)]
    pub add_special_on_incremental: bool,

    /// Parse control markup in rendered chat text as special tokens.
    #[serde(default)]
    pub parse_special: bool,
}

fn default_context_size() -> usize {
    2048
}

fn default_max_sequences() -> usize {
    1
}

fn default_assistant_marker() -> String {
    "assistant".to_string()
}

fn default_template_buffer_bytes() -> usize {
    4096
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            context_size: default_context_size(),
            batch_capacity: None,
            max_sequences: default_max_sequences(),
            sequence_id: 0,
            assistant_marker: default_assistant_marker(),
            template_buffer_bytes: default_template_buffer_bytes(),
            add_special_on_incremental: false,
            parse_special: false,
        }
    }
}

impl SessionConfig {
    /// Default configuration with a different window.
    pub fn with_context_size(context_size: usize) -> Self {
        SessionConfig {
            context_size,
            ..Self::default()
        }
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity.unwrap_or(self.context_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_size == 0 {
            return Err(ChatError::Config("context_size must be > 0".into()));
        }
        if self.batch_capacity() == 0 {
            return Err(ChatError::Config("batch_capacity must be > 0".into()));
        }
        if self.max_sequences == 0 {
            return Err(ChatError::Config("max_sequences must be > 0".into()));
        }
        let in_range = usize::try_from(self.sequence_id).is_ok_and(|id| id < self.max_sequences);
        if !in_range {
            return Err(ChatError::Config(format!(
                "sequence_id {} outside 0..{}",
                self.sequence_id, self.max_sequences
            )));
        }
        if self.assistant_marker.is_empty() {
            return Err(ChatError::Config("assistant_marker must not be empty".into()));
        }
        if self.template_buffer_bytes == 0 {
            return Err(ChatError::Config("template_buffer_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// Load and validate a session configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<SessionConfig> {
    let data = std::fs::read_to_string(path)?;
    let config: SessionConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
