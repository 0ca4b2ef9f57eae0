//! # llama-cli
//!
//! Drivers behind the `llama-chat` binary: a multi-turn chat loop that appends
//! each new user line to the warm cache, and a one-shot raw completion.
//!
//! Both run against the scripted [`MockBackend`]; input and output are generic
//! so the loops are testable without a terminal.

use std::io::{BufRead, Write};

use llama_chat::{
    ChatError, ChatTurn, CompletionSession, FinishReason, PlanMode, SessionConfig, StepOutput,
};
use llama_engine::{ContextParams, EngineBackend, EngineError, LlamaEngine, ModelSpec};
use llama_runtime::MockBackend;

/// Errors from the CLI drivers.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;

/// Settings shared by both subcommands.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model: String,
    pub config: SessionConfig,
    pub max_tokens: usize,
    pub replies: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            model: "scripted".to_string(),
            config: SessionConfig::default(),
            max_tokens: 128,
            replies: Vec::new(),
        }
    }
}

/// What a run did, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub replies: usize,
    pub full_resets: usize,
    pub used_cells: usize,
    pub last_finish: Option<FinishReason>,
}

/// Load the model and bind a session to a fresh context.
pub fn open_session<B: EngineBackend>(
    backend: &B,
    options: &RunOptions,
) -> CliResult<CompletionSession<B::Engine>> {
    let model = backend.load_model(&ModelSpec {
        path: options.model.clone(),
    })?;
    let params = ContextParams::new(options.config.context_size);
    let engine = backend.create_context(&model, &params)?;
    Ok(CompletionSession::new(engine, options.config.clone())?)
}

/// Step until generation ends, writing text as it completes.
pub fn stream_reply<E: LlamaEngine, W: Write>(
    session: &mut CompletionSession<E>,
    out: &mut W,
) -> CliResult<(String, FinishReason)> {
    let mut reply = String::new();
    loop {
        let text = match session.step() {
            Ok(StepOutput::Text(text)) => text,
            Ok(StepOutput::End(reason)) => {
                writeln!(out)?;
                out.flush()?;
                return Ok((reply, reason));
            }
            Err(ChatError::MalformedOutput { text, .. }) => text,
            Err(e) => return Err(e.into()),
        };
        out.write_all(text.as_bytes())?;
        out.flush()?;
        reply.push_str(&text);
    }
}

/// Prefill `transcript`, stream the reply, then treat every non-empty line of
/// `input` as a new user turn.
///
/// New turns are appended to the cache. When one does not fit, the whole
/// history is re-decoded from scratch instead.
pub fn run_chat<R: BufRead, W: Write>(
    options: &RunOptions,
    transcript: Vec<ChatTurn>,
    input: R,
    out: &mut W,
) -> CliResult<RunSummary> {
    let backend = MockBackend::with_replies(options.replies.clone());
    let mut session = open_session(&backend, options)?;
    let mut history = transcript;
    let mut summary = RunSummary {
        replies: 0,
        full_resets: 0,
        used_cells: 0,
        last_finish: None,
    };

    session.init(&history, options.max_tokens)?;
    let (reply, reason) = stream_reply(&mut session, out)?;
    history.push(ChatTurn::assistant(reply));
    summary.replies += 1;
    summary.last_finish = Some(reason);

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let turn = ChatTurn::user(line);
        history.push(turn.clone());

        match session.submit_incremental_turn(&turn, options.max_tokens) {
            Ok(next) => tracing::debug!(next_position = next, "turn appended"),
            Err(ChatError::CapacityExceeded { request, capacity }) => {
                tracing::warn!(%request, capacity, "turn does not fit, re-decoding history");
                session.init_with(&history, options.max_tokens, PlanMode::ForceFullReset)?;
                summary.full_resets += 1;
            }
            Err(e) => return Err(e.into()),
        }

        let (reply, reason) = stream_reply(&mut session, out)?;
        history.push(ChatTurn::assistant(reply));
        summary.replies += 1;
        summary.last_finish = Some(reason);
    }

    summary.used_cells = session.used_cells();
    Ok(summary)
}

/// Complete raw text without a chat template.
pub fn run_complete<W: Write>(
    options: &RunOptions,
    prompt: &str,
    parse_special: bool,
    out: &mut W,
) -> CliResult<RunSummary> {
    let backend = MockBackend::with_replies(options.replies.clone());
    let mut session = open_session(&backend, options)?;
    session.init_raw(prompt, options.max_tokens, parse_special)?;
    let (_, reason) = stream_reply(&mut session, out)?;
    Ok(RunSummary {
        replies: 1,
        full_resets: 0,
        used_cells: session.used_cells(),
        last_finish: Some(reason),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn options(window: usize, max_tokens: usize, replies: &[&str]) -> RunOptions {
        RunOptions {
            config: SessionConfig::with_context_size(window),
            max_tokens,
            replies: replies.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn chat_streams_each_reply() {
        let opts = options(1024, 32, &["first", "second"]);
        let mut out = Vec::new();
        let summary = run_chat(
            &opts,
            vec![ChatTurn::user("hi")],
            Cursor::new("next question\n\n"),
            &mut out,
        )
        .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "first\nsecond\n");
        assert_eq!(summary.replies, 2);
        assert_eq!(summary.full_resets, 0);
        assert_eq!(summary.last_finish, Some(FinishReason::EndOfGeneration));
    }

    #[test]
    fn chat_turn_that_fits_nowhere_surfaces_capacity_error() {
        // 62 prompt tokens + 40 reserved fit a 150-cell window; appending the
        // next turn does not, and neither does re-decoding the whole history.
        let opts = options(150, 40, &["a", "b"]);
        let mut out = Vec::new();
        let err = run_chat(
            &opts,
            vec![ChatTurn::user("hello there")],
            Cursor::new("more\n"),
            &mut out,
        )
        .unwrap_err();

        assert_eq!(String::from_utf8(out).unwrap(), "a\n");
        match err {
            CliError::Chat(ChatError::CapacityExceeded { request, capacity }) => {
                assert_eq!(capacity, 150);
                assert_eq!(request.used, 0, "error should come from the full reset");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn chat_prompt_too_large_is_rejected() {
        let opts = options(64, 16, &["x"]);
        let mut out = Vec::new();
        let err = run_chat(
            &opts,
            vec![ChatTurn::user("y".repeat(100))],
            Cursor::new(""),
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Chat(ChatError::CapacityExceeded { .. })));
        assert!(out.is_empty());
    }

    #[test]
    fn complete_raw_prompt() {
        let opts = options(256, 3, &["done"]);
        let mut out = Vec::new();
        let summary = run_complete(&opts, "Once upon a time", false, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "don\n");
        assert_eq!(summary.last_finish, Some(FinishReason::Budget));
        // BOS + 16 prompt bytes + 3 generated
        assert_eq!(summary.used_cells, 1 + 16 + 3);
    }

    #[test]
    fn empty_model_path_is_engine_error() {
        let opts = RunOptions {
            model: String::new(),
            ..Default::default()
        };
        let err = run_complete(&opts, "x", false, &mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, CliError::Engine(EngineError::ModelLoad(_))));
    }
}
