//! Error types for the llama-chat session layer.

use std::fmt;

use thiserror::Error;

use llama_engine::{BatchError, EngineError, Role};
use llama_kv::{CapacityRequest, KVError};

use crate::planner::RejectReason;
use crate::session::Phase;

/// Engine call that failed, recorded alongside the engine's own error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Tokenize,
    Detokenize,
    Prefill,
    Append,
    Generate,
    Sample,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOp::Tokenize => "tokenize",
            EngineOp::Detokenize => "detokenize",
            EngineOp::Prefill => "prefill decode",
            EngineOp::Append => "incremental decode",
            EngineOp::Generate => "generation decode",
            EngineOp::Sample => "sample",
        };
        f.write_str(name)
    }
}

/// Top-level error type for session operations.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("context capacity exceeded: {request} > {capacity} cells")]
    CapacityExceeded {
        request: CapacityRequest,
        capacity: usize,
    },

    #[error("KV cache is empty, nothing to append to")]
    CacheEmpty,

    #[error("trailing {role} turn cannot be appended incrementally")]
    NotIncremental { role: Role },

    #[error("prompt tokenized to zero tokens")]
    EmptyPrompt,

    #[error("chat template failed with code {code}")]
    TemplateFailure { code: i32 },

    #[error("chat template produced invalid UTF-8: {0}")]
    TemplateEncoding(#[from] std::string::FromUtf8Error),

    #[error("{op} failed at position {position}: {source}")]
    EngineDecode {
        op: EngineOp,
        position: usize,
        #[source]
        source: EngineError,
    },

    #[error("{op} failed: {source}")]
    Engine {
        op: EngineOp,
        #[source]
        source: EngineError,
    },

    #[error("malformed turn: {0}")]
    MalformedTurn(String),

    #[error("model emitted malformed UTF-8 {invalid:02x?}")]
    MalformedOutput { text: String, invalid: Vec<u8> },

    #[error("{tokens} tokens exceed batch capacity {capacity}")]
    BatchOverflow { tokens: usize, capacity: usize },

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("KV accounting error: {0}")]
    Kv(#[from] KVError),

    #[error("cannot {op} while session is {phase}")]
    InvalidState { op: &'static str, phase: Phase },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    pub(crate) fn engine(op: EngineOp) -> impl FnOnce(EngineError) -> ChatError {
        move |source| ChatError::Engine { op, source }
    }

    /// Rejections the caller can recover from without clearing the session.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChatError::CapacityExceeded { .. }
                | ChatError::CacheEmpty
                | ChatError::NotIncremental { .. }
                | ChatError::EmptyPrompt
        )
    }
}

impl From<RejectReason> for ChatError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::CapacityExceeded { request, capacity } => {
                ChatError::CapacityExceeded { request, capacity }
            }
            RejectReason::CacheEmpty => ChatError::CacheEmpty,
            RejectReason::NotIncremental { role } => ChatError::NotIncremental { role },
            RejectReason::EmptyPrompt => ChatError::EmptyPrompt,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_shows_terms() {
        let err = ChatError::CapacityExceeded {
            request: CapacityRequest::new(0, 2000, 100),
            capacity: 2048,
        };
        assert_eq!(
            err.to_string(),
            "context capacity exceeded: used 0 + incoming 2000 + reserve 100 > 2048 cells"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn decode_failure_carries_op_and_position() {
        let err = ChatError::EngineDecode {
            op: EngineOp::Generate,
            position: 61,
            source: EngineError::Decode("boom".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "generation decode failed at position 61: decode failed: boom"
        );
        assert!(!err.is_rejection());
    }

    #[test]
    fn reject_reason_maps_to_error() {
        let err: ChatError = RejectReason::NotIncremental {
            role: Role::Assistant,
        }
        .into();
        assert!(matches!(err, ChatError::NotIncremental { role: Role::Assistant }));
        assert_eq!(
            err.to_string(),
            "trailing assistant turn cannot be appended incrementally"
        );
    }
}
