//! Turn planning: decide how a new prompt reaches the KV cache.
//!
//! A prompt is either decoded from scratch over an emptied cache
//! ([`Decision::FullReset`]) or only its newest turn is appended after the
//! occupied cells ([`Decision::Incremental`]). Requests that cannot be served
//! come back as [`Decision::Reject`] values; nothing is truncated or evicted.
//!
//! Every accepted decision reserves room for `max_new_tokens` generated tokens
//! on top of the prompt.

use llama_engine::{ChatTurn, LlamaEngine, Role, TokenId};
use llama_kv::{CapacityRequest, CapacityTracker};

use crate::config::SessionConfig;
use crate::error::{ChatError, EngineOp, Result};
use crate::prompt::PromptFormatter;
use crate::transcript::last_turn;

/// How the caller wants a transcript submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanMode {
    /// Append the trailing user turn when the cache is warm, otherwise reset.
    #[default]
    Auto,
    /// Always re-render and re-decode the whole transcript.
    ForceFullReset,
    /// Only append; never reset the cache.
    IncrementalOnly,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("{request} > {capacity} cells")]
    CapacityExceeded {
        request: CapacityRequest,
        capacity: usize,
    },
    #[error("KV cache is empty")]
    CacheEmpty,
    #[error("trailing {role} turn is not incremental")]
    NotIncremental { role: Role },
    #[error("prompt tokenized to zero tokens")]
    EmptyPrompt,
}

/// Outcome of planning one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Clear the cache and decode `tokens` from position 0.
    FullReset { tokens: Vec<TokenId> },
    /// Decode `tokens` starting at `start_position`, keeping the cache.
    Incremental {
        tokens: Vec<TokenId>,
        start_position: usize,
    },
    Reject(RejectReason),
}

impl Decision {
    pub fn tokens(&self) -> &[TokenId] {
        match self {
            Decision::FullReset { tokens } | Decision::Incremental { tokens, .. } => tokens,
            Decision::Reject(_) => &[],
        }
    }
}

/// Plans prompts against the session's capacity view.
#[derive(Debug)]
pub struct IncrementalPlanner {
    formatter: PromptFormatter,
    add_special_on_incremental: bool,
    parse_special: bool,
}

impl IncrementalPlanner {
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_formatter(PromptFormatter::new(config), config)
    }

    pub fn with_formatter(formatter: PromptFormatter, config: &SessionConfig) -> Self {
        Self {
            formatter,
            add_special_on_incremental: config.add_special_on_incremental,
            parse_special: config.parse_special,
        }
    }

    pub fn formatter(&self) -> &PromptFormatter {
        &self.formatter
    }

    /// Plan a transcript.
    ///
    /// `tracker` is the session's current cell accounting. In `Auto` mode a
    /// warm cache with a trailing user turn is planned incrementally; any
    /// other trailing role, or an empty cache, re-decodes the whole transcript.
    ///
    /// # Errors
    /// - `MalformedTurn`: the transcript is empty
    /// - `TemplateFailure` / `Engine`: rendering or tokenization failed
    pub fn plan<E: LlamaEngine + ?Sized>(
        &self,
        engine: &E,
        tracker: &CapacityTracker,
        turns: &[ChatTurn],
        max_new_tokens: usize,
        mode: PlanMode,
    ) -> Result<Decision> {
        let last = last_turn(turns)?;

        if mode == PlanMode::ForceFullReset {
            return self.plan_full(engine, tracker, turns, max_new_tokens);
        }
        if tracker.is_empty() {
            if mode == PlanMode::IncrementalOnly {
                return Ok(Decision::Reject(RejectReason::CacheEmpty));
            }
            return self.plan_full(engine, tracker, turns, max_new_tokens);
        }

        if last.role != Role::User {
            if mode == PlanMode::IncrementalOnly {
                return Ok(Decision::Reject(RejectReason::NotIncremental { role: last.role }));
            }
            tracing::debug!(role = %last.role, "trailing turn is not a user turn, resetting");
            return self.plan_full(engine, tracker, turns, max_new_tokens);
        }

        let rendered = self.formatter.format_turn(engine, last)?;
        let tokens = engine
            .tokenize(
                rendered.incremental_segment(),
                self.add_special_on_incremental,
                self.parse_special,
            )
            .map_err(ChatError::engine(EngineOp::Tokenize))?;

        let start_position = tracker.used();
        let decision = self.admit(tracker, tokens, max_new_tokens, |tokens| {
            Decision::Incremental {
                tokens,
                start_position,
            }
        });
        Ok(decision)
    }

    /// Plan raw text (no chat template) as a full reset.
    pub fn plan_raw<E: LlamaEngine + ?Sized>(
        &self,
        engine: &E,
        tracker: &CapacityTracker,
        text: &str,
        max_new_tokens: usize,
        parse_special: bool,
    ) -> Result<Decision> {
        let tokens = engine
            .tokenize(text, true, parse_special)
            .map_err(ChatError::engine(EngineOp::Tokenize))?;
        let empty = CapacityTracker::new(tracker.capacity());
        Ok(self.admit(&empty, tokens, max_new_tokens, |tokens| {
            Decision::FullReset { tokens }
        }))
    }

    fn plan_full<E: LlamaEngine + ?Sized>(
        &self,
        engine: &E,
        tracker: &CapacityTracker,
        turns: &[ChatTurn],
        max_new_tokens: usize,
    ) -> Result<Decision> {
        let rendered = self.formatter.format(engine, turns)?;
        let tokens = engine
            .tokenize(&rendered.text, true, self.parse_special)
            .map_err(ChatError::engine(EngineOp::Tokenize))?;
        // a reset discards every occupied cell
        let empty = CapacityTracker::new(tracker.capacity());
        Ok(self.admit(&empty, tokens, max_new_tokens, |tokens| {
            Decision::FullReset { tokens }
        }))
    }

    fn admit(
        &self,
        tracker: &CapacityTracker,
        tokens: Vec<TokenId>,
        max_new_tokens: usize,
        accept: impl FnOnce(Vec<TokenId>) -> Decision,
    ) -> Decision {
        if tokens.is_empty() {
            return Decision::Reject(RejectReason::EmptyPrompt);
        }
        if tokens.len() > max_new_tokens {
            tracing::warn!(
                prompt = tokens.len(),
                max_new_tokens,
                "prompt is longer than the generation budget"
            );
        }
        if !tracker.fits(tokens.len(), max_new_tokens) {
            let request = CapacityRequest::new(tracker.used(), tokens.len(), max_new_tokens);
            tracing::debug!(%request, capacity = tracker.capacity(), "rejecting prompt");
            return Decision::Reject(RejectReason::CapacityExceeded {
                request,
                capacity: tracker.capacity(),
            });
        }
        accept(tokens)
    }
}
