//! Transcript parsing.
//!
//! A transcript is a JSON array of `{"role": ..., "content": ...}` objects.
//! Missing fields and unknown roles are reported as [`ChatError::MalformedTurn`].

use std::path::Path;

use serde::Deserialize;

use llama_engine::{ChatTurn, Role};

use crate::error::{ChatError, Result};

/// A turn as it appears on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTurn {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl TryFrom<RawTurn> for ChatTurn {
    type Error = ChatError;

    fn try_from(raw: RawTurn) -> Result<ChatTurn> {
        let role = raw
            .role
            .ok_or_else(|| ChatError::MalformedTurn("missing role".into()))?;
        let role: Role = role.parse().map_err(ChatError::MalformedTurn)?;
        let content = raw
            .content
            .ok_or_else(|| ChatError::MalformedTurn(format!("{role} turn has no content")))?;
        Ok(ChatTurn::new(role, content))
    }
}

/// The turn a new prompt ends with. Empty transcripts cannot be rendered.
pub fn last_turn(turns: &[ChatTurn]) -> Result<&ChatTurn> {
    turns
        .last()
        .ok_or_else(|| ChatError::MalformedTurn("transcript has no turns".into()))
}

/// Parse a transcript from JSON text.
pub fn parse_transcript(json: &str) -> Result<Vec<ChatTurn>> {
    let raw: Vec<RawTurn> = serde_json::from_str(json)?;
    let turns = raw
        .into_iter()
        .enumerate()
        .map(|(i, turn)| {
            ChatTurn::try_from(turn).map_err(|e| match e {
                ChatError::MalformedTurn(msg) => ChatError::MalformedTurn(format!("turn {i}: {msg}")),
                other => other,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    last_turn(&turns)?;
    Ok(turns)
}

/// Load a transcript from a JSON file.
pub fn load_transcript(path: &Path) -> Result<Vec<ChatTurn>> {
    let data = std::fs::read_to_string(path)?;
    parse_transcript(&data)
}
