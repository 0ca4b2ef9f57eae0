//! Completion session management.
//!
//! A [`CompletionSession`] owns one engine context and drives it through a
//! conversation: it plans each prompt against the KV cache, decodes it, and
//! then produces the reply one token per [`step`](CompletionSession::step).
//!
//! ```text
//! Idle ──init──▶ Prefilling ──decode ok──▶ Generating ──end/budget──▶ Finished
//!                    │                         │                        │
//!                    └──────── failure ────────┴──────▶ Errored ◀───────┘
//! ```
//!
//! Every state returns to `Idle` through [`clear`](CompletionSession::clear).
//! A session errored by a planner rejection still holds its cache untouched
//! and accepts a smaller request; one errored by an engine or template
//! failure only accepts a forced full reset.
//! There are no background threads: the caller pauses or cancels generation
//! simply by not calling `step()` again.

use std::fmt;

use tracing::Span;
use uuid::Uuid;

use llama_engine::{ChatTurn, LlamaEngine, TokenId};
use llama_tokenizer::StreamError;

use crate::batch::BatchBuilder;
use crate::config::SessionConfig;
use crate::error::{ChatError, EngineOp, Result};
use crate::planner::{Decision, IncrementalPlanner, PlanMode};
use crate::state::SessionState;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Prefilling,
    Generating,
    Finished,
    Errored,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Prefilling => "prefilling",
            Phase::Generating => "generating",
            Phase::Finished => "finished",
            Phase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model sampled an end-of-generation token.
    EndOfGeneration,
    /// `max_new_tokens` tokens were generated.
    Budget,
    /// No cell is left for another token. The reserve taken at planning
    /// normally ends generation on `Budget` first.
    ContextFull,
}

/// Result of one generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// Newly completed text; empty while a character is still incomplete.
    Text(String),
    End(FinishReason),
}

impl StepOutput {
    pub fn text(&self) -> Option<&str> {
        match self {
            StepOutput::Text(text) => Some(text),
            StepOutput::End(_) => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StepOutput::End(_))
    }
}

/// A single conversation bound to one engine context.
pub struct CompletionSession<E: LlamaEngine> {
    id: Uuid,
    span: Span,
    engine: E,
    config: SessionConfig,
    planner: IncrementalPlanner,
    batch: BatchBuilder,
    state: SessionState,
    phase: Phase,
    /// Set while `Errored` by a rejection that left the cache untouched.
    cache_intact: bool,
    max_new_tokens: usize,
    generated: usize,
    finish_reason: Option<FinishReason>,
}

impl<E: LlamaEngine> CompletionSession<E> {
    /// Bind a session to `engine`.
    ///
    /// The batch buffer is allocated here once and reused for every decode.
    ///
    /// # Errors
    /// - `Config`: invalid configuration, or a window larger than the engine context
    pub fn new(mut engine: E, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        if config.context_size > engine.capacity() {
            return Err(ChatError::Config(format!(
                "context_size {} exceeds engine context {}",
                config.context_size,
                engine.capacity()
            )));
        }

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", %id);
        if engine.used_cells() > 0 {
            tracing::warn!(
                parent: &span,
                cells = engine.used_cells(),
                "engine cache not empty, clearing"
            );
            engine.clear_cache();
        }
        tracing::info!(
            parent: &span,
            window = config.context_size,
            batch = config.batch_capacity(),
            "session created"
        );

        Ok(CompletionSession {
            id,
            span,
            planner: IncrementalPlanner::new(&config),
            batch: BatchBuilder::new(
                config.batch_capacity(),
                config.max_sequences,
                config.sequence_id,
            ),
            state: SessionState::new(config.context_size),
            engine,
            config,
            phase: Phase::Idle,
            cache_intact: false,
            max_new_tokens: 0,
            generated: 0,
            finish_reason: None,
        })
    }

    /// Session with default settings and a `window_size`-cell window.
    pub fn create(engine: E, window_size: usize) -> Result<Self> {
        Self::new(engine, SessionConfig::with_context_size(window_size))
    }

    /// Replace the planner, e.g. to use a custom template boundary rule.
    pub fn with_planner(mut self, planner: IncrementalPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Plan and decode a transcript, appending incrementally when possible.
    ///
    /// Returns the number of prompt tokens decoded.
    ///
    /// # Errors
    /// - `CapacityExceeded`: the prompt plus `max_new_tokens` does not fit; the
    ///   cache is untouched and the caller may retry with a smaller request or
    ///   with [`PlanMode::ForceFullReset`]
    /// - `MalformedTurn`: empty transcript, rejected before any engine call
    /// - `TemplateFailure`, `EngineDecode`, `Engine`: the session is `Errored`
    /// - `InvalidState`: called while a turn is still prefilling or generating
    pub fn init(&mut self, turns: &[ChatTurn], max_new_tokens: usize) -> Result<usize> {
        self.init_with(turns, max_new_tokens, PlanMode::Auto)
    }

    /// [`init`](Self::init) with an explicit planning mode.
    pub fn init_with(
        &mut self,
        turns: &[ChatTurn],
        max_new_tokens: usize,
        mode: PlanMode,
    ) -> Result<usize> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.ensure_can_init("init", mode)?;

        self.guarded(|s| {
            let decision = s.planner.plan(
                &s.engine,
                s.state.tracker(),
                turns,
                max_new_tokens,
                mode,
            )?;
            s.apply(decision, max_new_tokens)
        })
    }

    /// Decode raw text without a chat template, always over an emptied cache.
    ///
    /// `parse_special` controls whether control markup in `text` becomes
    /// special tokens.
    pub fn init_raw(
        &mut self,
        text: &str,
        max_new_tokens: usize,
        parse_special: bool,
    ) -> Result<usize> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.ensure_can_init("init_raw", PlanMode::ForceFullReset)?;

        self.guarded(|s| {
            let decision = s.planner.plan_raw(
                &s.engine,
                s.state.tracker(),
                text,
                max_new_tokens,
                parse_special,
            )?;
            s.apply(decision, max_new_tokens)
        })
    }

    /// Append one user turn after the cached conversation.
    ///
    /// Never resets the cache. Returns the next free position afterwards.
    ///
    /// # Errors
    /// - `CacheEmpty`: nothing has been decoded yet
    /// - `NotIncremental`: `turn` is not a user turn
    /// - `CapacityExceeded`: the turn plus `max_new_tokens` does not fit
    pub fn submit_incremental_turn(
        &mut self,
        turn: &ChatTurn,
        max_new_tokens: usize,
    ) -> Result<usize> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.ensure_can_init("submit_incremental_turn", PlanMode::IncrementalOnly)?;

        self.guarded(|s| {
            let decision = s.planner.plan(
                &s.engine,
                s.state.tracker(),
                std::slice::from_ref(turn),
                max_new_tokens,
                PlanMode::IncrementalOnly,
            )?;
            s.apply(decision, max_new_tokens)?;
            Ok(s.state.next_position())
        })
    }

    /// Sample, emit and decode one token.
    ///
    /// # Errors
    /// - `MalformedOutput`: the model produced bytes that are not UTF-8; they
    ///   are discarded and the session keeps generating
    /// - `Engine`, `EngineDecode`: the session is `Errored`
    /// - `InvalidState`: no turn is generating
    pub fn step(&mut self) -> Result<StepOutput> {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.phase != Phase::Generating {
            return Err(ChatError::InvalidState {
                op: "step",
                phase: self.phase,
            });
        }
        self.guarded(Self::generate_one)
    }

    /// Step until generation ends and return the whole reply.
    ///
    /// Malformed output bytes are skipped with a warning.
    pub fn generate_to_end(&mut self) -> Result<(String, FinishReason)> {
        let mut reply = String::new();
        loop {
            match self.step() {
                Ok(StepOutput::Text(text)) => reply.push_str(&text),
                Ok(StepOutput::End(reason)) => return Ok((reply, reason)),
                Err(ChatError::MalformedOutput { text, .. }) => reply.push_str(&text),
                Err(e) => return Err(e),
            }
        }
    }

    /// Empty the engine cache and all session bookkeeping. Allowed in every
    /// phase; calling it twice is the same as calling it once.
    pub fn clear(&mut self) {
        let _enter = self.span.enter();
        self.engine.clear_cache();
        self.state.clear();
        self.batch.clear();
        self.phase = Phase::Idle;
        self.cache_intact = false;
        self.max_new_tokens = 0;
        self.generated = 0;
        self.finish_reason = None;
        tracing::debug!("session cleared");
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn used_cells(&self) -> usize {
        self.state.used_cells()
    }

    pub fn next_position(&self) -> usize {
        self.state.next_position()
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity()
    }

    pub fn pending_bytes(&self) -> &[u8] {
        self.state.pending_bytes()
    }

    /// Tokens generated for the current turn.
    pub fn generated(&self) -> usize {
        self.generated
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn ensure_can_init(&self, op: &'static str, mode: PlanMode) -> Result<()> {
        match self.phase {
            Phase::Idle | Phase::Finished => Ok(()),
            Phase::Errored if self.cache_intact || mode == PlanMode::ForceFullReset => Ok(()),
            phase => Err(ChatError::InvalidState { op, phase }),
        }
    }

    /// Run `f`, moving to `Errored` on any failure that leaves the cache or
    /// the current turn unusable.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let intact = self.phase != Phase::Errored || self.cache_intact;
        let result = f(self);
        if let Err(e) = &result {
            match e {
                ChatError::InvalidState { .. }
                | ChatError::MalformedTurn(_)
                | ChatError::MalformedOutput { .. } => {}
                e if e.is_rejection() => {
                    tracing::info!(error = %e, "request rejected");
                    self.phase = Phase::Errored;
                    self.cache_intact = intact;
                }
                e => {
                    tracing::error!(error = %e, phase = %self.phase, "session failed");
                    self.phase = Phase::Errored;
                    self.cache_intact = false;
                }
            }
        }
        result
    }

    fn apply(&mut self, decision: Decision, max_new_tokens: usize) -> Result<usize> {
        match decision {
            Decision::Reject(reason) => Err(reason.into()),
            Decision::FullReset { tokens } => {
                self.reset_cache();
                self.prefill(&tokens, 0, EngineOp::Prefill, max_new_tokens)
            }
            Decision::Incremental {
                tokens,
                start_position,
            } => self.prefill(&tokens, start_position, EngineOp::Append, max_new_tokens),
        }
    }

    fn reset_cache(&mut self) {
        if self.state.used_cells() > 0 || self.engine.used_cells() > 0 {
            tracing::debug!(cells = %self.state.tracker(), "clearing cache for full reset");
            self.engine.clear_cache();
        }
        self.state.clear();
    }

    fn prefill(
        &mut self,
        tokens: &[TokenId],
        start: usize,
        op: EngineOp,
        max_new_tokens: usize,
    ) -> Result<usize> {
        self.phase = Phase::Prefilling;
        let batch = self.batch.prefill(tokens, start)?;
        self.engine
            .decode(batch)
            .map_err(|source| ChatError::EngineDecode {
                op,
                position: start,
                source,
            })?;
        self.state.commit(start, tokens.len())?;
        self.check_engine_cells();

        self.state.stream_mut().reset();
        self.max_new_tokens = max_new_tokens;
        self.generated = 0;
        self.finish_reason = None;
        self.phase = Phase::Generating;
        tracing::debug!(
            %op,
            start,
            tokens = tokens.len(),
            cells = %self.state.tracker(),
            "prompt decoded"
        );
        Ok(tokens.len())
    }

    fn generate_one(&mut self) -> Result<StepOutput> {
        if self.generated >= self.max_new_tokens {
            return Ok(self.finish(FinishReason::Budget));
        }
        if !self.state.tracker().fits(1, 0) {
            return Ok(self.finish(FinishReason::ContextFull));
        }

        let token = self
            .engine
            .sample()
            .map_err(ChatError::engine(EngineOp::Sample))?;
        if self.engine.is_end_of_generation(token) {
            return Ok(self.finish(FinishReason::EndOfGeneration));
        }
        let bytes = self
            .engine
            .detokenize(token)
            .map_err(ChatError::engine(EngineOp::Detokenize))?;

        let position = self.state.next_position();
        let batch = self.batch.generation_step(token, position)?;
        self.engine
            .decode(batch)
            .map_err(|source| ChatError::EngineDecode {
                op: EngineOp::Generate,
                position,
                source,
            })?;
        self.state.commit(position, 1)?;
        self.generated += 1;
        self.check_engine_cells();

        match self.state.stream_mut().push(&bytes) {
            Ok(text) => Ok(StepOutput::Text(text)),
            Err(StreamError::Malformed { text, invalid }) => {
                tracing::warn!(?invalid, "discarding malformed UTF-8 in model output");
                Err(ChatError::MalformedOutput { text, invalid })
            }
        }
    }

    fn finish(&mut self, reason: FinishReason) -> StepOutput {
        let dropped = self.state.stream_mut().take_pending();
        if !dropped.is_empty() {
            tracing::warn!(bytes = ?dropped, "dropping incomplete character at end of generation");
        }
        self.phase = Phase::Finished;
        self.finish_reason = Some(reason);
        tracing::debug!(
            ?reason,
            generated = self.generated,
            cells = %self.state.tracker(),
            "generation finished"
        );
        StepOutput::End(reason)
    }

    fn check_engine_cells(&self) {
        let engine_cells = self.engine.used_cells();
        if engine_cells != self.state.used_cells() {
            tracing::warn!(
                session = self.state.used_cells(),
                engine = engine_cells,
                "KV cell count diverged from engine"
            );
        }
    }
}

impl<E: LlamaEngine> fmt::Debug for CompletionSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSession")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("cells", &self.state.tracker().to_string())
            .field("next_position", &self.state.next_position())
            .field("generated", &self.generated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_runtime::MockEngine;

    fn session(window: usize, reply: &str) -> CompletionSession<MockEngine> {
        CompletionSession::create(MockEngine::new(window).with_replies([reply]), window).unwrap()
    }

    #[test]
    fn new_session_is_idle_and_empty() {
        let s = session(128, "x");
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.used_cells(), 0);
        assert_eq!(s.next_position(), 0);
        assert_eq!(s.capacity(), 128);
        assert!(s.pending_bytes().is_empty());
    }

    #[test]
    fn window_larger_than_engine_is_config_error() {
        let err = CompletionSession::create(MockEngine::new(64), 128).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn init_then_generate_reply() {
        let mut s = session(256, "ok");
        let n = s.init(&[ChatTurn::user("hi")], 16).unwrap();
        assert_eq!(s.phase(), Phase::Generating);
        assert_eq!(s.used_cells(), n);
        assert_eq!(s.next_position(), n);

        assert_eq!(s.step().unwrap(), StepOutput::Text("o".into()));
        assert_eq!(s.step().unwrap(), StepOutput::Text("k".into()));
        assert_eq!(s.step().unwrap(), StepOutput::End(FinishReason::EndOfGeneration));
        assert_eq!(s.phase(), Phase::Finished);
        assert_eq!(s.used_cells(), n + 2);
        assert_eq!(s.engine().used_cells(), n + 2);
    }

    #[test]
    fn step_outside_generation_is_invalid() {
        let mut s = session(64, "x");
        let err = s.step().unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidState {
                op: "step",
                phase: Phase::Idle
            }
        ));
    }

    #[test]
    fn init_while_generating_is_invalid() {
        let mut s = session(256, "long reply");
        s.init(&[ChatTurn::user("hi")], 32).unwrap();
        let err = s.init(&[ChatTurn::user("again")], 32).unwrap_err();
        assert!(matches!(err, ChatError::InvalidState { phase: Phase::Generating, .. }));
        assert_eq!(s.phase(), Phase::Generating);
    }

    #[test]
    fn budget_stops_generation() {
        let mut s = session(256, "abcdef");
        s.init(&[ChatTurn::user("hi")], 3).unwrap();
        let (text, reason) = s.generate_to_end().unwrap();
        assert_eq!(text, "abc");
        assert_eq!(reason, FinishReason::Budget);
        assert_eq!(s.generated(), 3);
        assert_eq!(s.finish_reason(), Some(FinishReason::Budget));
    }

    #[test]
    fn clear_returns_to_idle() {
        let mut s = session(256, "ok");
        s.init(&[ChatTurn::user("hi")], 8).unwrap();
        s.step().unwrap();
        s.clear();
        assert_eq!(s.phase(), Phase::Idle);
        assert_eq!(s.used_cells(), 0);
        assert_eq!(s.engine().used_cells(), 0);
    }

    #[test]
    fn generation_past_budget_stops_at_context_full() {
        let mut s = session(128, &"z".repeat(200));
        let n = s.init(&[ChatTurn::user("hi")], 4).unwrap();
        // lift the budget the reserve check was made against
        s.max_new_tokens = usize::MAX;

        let (text, reason) = s.generate_to_end().unwrap();
        assert_eq!(reason, FinishReason::ContextFull);
        assert_eq!(text.len(), 128 - n);
        assert_eq!(s.used_cells(), 128);
        assert_eq!(s.engine().used_cells(), 128);
        assert_eq!(s.phase(), Phase::Finished);
    }

    #[test]
    fn rejection_after_engine_failure_stays_strict() {
        let engine = MockEngine::new(128).fail_decode_on(1);
        let mut s = CompletionSession::create(engine, 128).unwrap();
        s.init(&[ChatTurn::user("hi")], 8).unwrap_err();
        assert!(!s.cache_intact);

        let err = s
            .init_with(&[ChatTurn::user("x".repeat(200))], 8, PlanMode::ForceFullReset)
            .unwrap_err();
        assert!(matches!(err, ChatError::CapacityExceeded { .. }));
        assert!(!s.cache_intact);
        assert!(matches!(
            s.init(&[ChatTurn::user("hi")], 8),
            Err(ChatError::InvalidState { phase: Phase::Errored, .. })
        ));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Errored.to_string(), "errored");
        assert_eq!(Phase::Prefilling.to_string(), "prefilling");
    }
}
