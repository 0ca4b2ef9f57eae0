//! Scripted engine backend.

use llama_engine::{
    Batch, ChatTurn, ContextParams, EngineBackend, EngineError, LlamaEngine, ModelHandle,
    ModelSpec, Pos, Result, TokenId,
};
use llama_tokenizer::{ByteTokenizer, Tokenizer, EOS_TOKEN};

/// Reply used when no script is configured.
pub const DEFAULT_REPLY: &str = "Hello! How can I help you today?";

/// Snapshot of one `decode` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRecord {
    pub tokens: Vec<TokenId>,
    pub positions: Vec<Pos>,
    pub logits: Vec<bool>,
}

/// Creates [`MockEngine`] contexts sharing one reply script.
#[derive(Debug, Clone)]
pub struct MockBackend {
    replies: Vec<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            replies: vec![DEFAULT_REPLY.to_string()],
        }
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies.into_iter().map(Into::into).collect();
        if replies.is_empty() {
            return Self::new();
        }
        Self { replies }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for MockBackend {
    type Engine = MockEngine;

    fn load_model(&self, spec: &ModelSpec) -> Result<ModelHandle> {
        if spec.path.is_empty() {
            return Err(EngineError::ModelLoad("empty model path".to_string()));
        }
        tracing::info!(path = %spec.path, "loading scripted model");
        Ok(ModelHandle { id: 1 })
    }

    fn create_context(&self, _model: &ModelHandle, params: &ContextParams) -> Result<MockEngine> {
        if params.window_size == 0 {
            return Err(EngineError::Context("window size must be > 0".to_string()));
        }
        tracing::debug!(
            window = params.window_size,
            threads = params.n_threads,
            "creating scripted context"
        );
        Ok(MockEngine::new(params.window_size).with_replies(self.replies.clone()))
    }
}

/// Deterministic engine: every prompt is answered with the next scripted reply,
/// one byte token per sample, followed by EOS.
#[derive(Debug, Clone)]
pub struct MockEngine {
    tokenizer: ByteTokenizer,
    window: usize,
    cells: Vec<TokenId>,
    logits_ready: bool,
    replies: Vec<String>,
    next_reply: usize,
    reply: Vec<TokenId>,
    reply_cursor: usize,
    last_sampled: Option<TokenId>,
    decode_calls: usize,
    fail_decode_on: Option<usize>,
    fail_template: bool,
    history: Vec<DecodeRecord>,
}

impl MockEngine {
    pub fn new(window: usize) -> Self {
        Self {
            tokenizer: ByteTokenizer::new(),
            window,
            cells: Vec::new(),
            logits_ready: false,
            replies: vec![DEFAULT_REPLY.to_string()],
            next_reply: 0,
            reply: Vec::new(),
            reply_cursor: 0,
            last_sampled: None,
            decode_calls: 0,
            fail_decode_on: None,
            fail_template: false,
            history: Vec::new(),
        }
    }

    /// Replace the reply script. Replies are used in order and then cycle.
    pub fn with_replies<I, S>(mut self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies.into_iter().map(Into::into).collect();
        if !replies.is_empty() {
            self.replies = replies;
            self.next_reply = 0;
        }
        self
    }

    /// Make the `n`th `decode` call (1-based, counted from now) fail.
    pub fn fail_decode_on(mut self, n: usize) -> Self {
        self.fail_decode_on = Some(self.decode_calls + n);
        self
    }

    /// Make every chat template call report failure.
    pub fn fail_template(mut self) -> Self {
        self.fail_template = true;
        self
    }

    pub fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    /// Tokens currently held in the cache, indexed by position.
    pub fn cells(&self) -> &[TokenId] {
        &self.cells
    }

    /// Every batch decoded so far.
    pub fn history(&self) -> &[DecodeRecord] {
        &self.history
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    fn render(turns: &[ChatTurn], add_assistant: bool) -> String {
        let mut out = String::new();
        for turn in turns {
            out.push_str("<|im_start|>");
            out.push_str(turn.role.as_str());
            out.push('\n');
            out.push_str(&turn.content);
            out.push_str("<|im_end|>\n");
        }
        if add_assistant {
            out.push_str("<|im_start|>assistant\n");
        }
        out
    }

    fn start_next_reply(&mut self) -> Result<()> {
        let text = &self.replies[self.next_reply % self.replies.len()];
        self.reply = self
            .tokenizer
            .encode(text, false, false)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        self.reply_cursor = 0;
        self.next_reply += 1;
        Ok(())
    }
}

impl LlamaEngine for MockEngine {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        self.tokenizer
            .encode(text, add_special, parse_special)
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>> {
        self.tokenizer
            .token_bytes(token)
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn apply_chat_template(&self, turns: &[ChatTurn], add_assistant: bool, buf: &mut [u8]) -> i32 {
        if self.fail_template {
            return -1;
        }
        let rendered = Self::render(turns, add_assistant);
        let n = rendered.len().min(buf.len());
        buf[..n].copy_from_slice(&rendered.as_bytes()[..n]);
        i32::try_from(rendered.len()).unwrap_or(-1)
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        self.decode_calls += 1;
        if self.fail_decode_on == Some(self.decode_calls) {
            return Err(EngineError::Decode("injected decode failure".to_string()));
        }
        if batch.is_empty() {
            return Err(EngineError::Decode("empty batch".to_string()));
        }
        if self.cells.len() + batch.len() > self.window {
            return Err(EngineError::Decode(format!(
                "KV cache full: {} cells used, {} incoming, window {}",
                self.cells.len(),
                batch.len(),
                self.window
            )));
        }
        for (i, entry) in batch.entries().enumerate() {
            let expected = (self.cells.len() + i) as Pos;
            if entry.pos != expected {
                return Err(EngineError::Decode(format!(
                    "position {} does not continue cache at {}",
                    entry.pos, expected
                )));
            }
        }

        let continuation = batch.len() == 1 && self.last_sampled == Some(batch.tokens()[0]);
        if !continuation {
            self.start_next_reply()?;
        }
        self.last_sampled = None;

        self.cells.extend_from_slice(batch.tokens());
        self.logits_ready = batch.last().is_some_and(|e| e.logits);
        self.history.push(DecodeRecord {
            tokens: batch.tokens().to_vec(),
            positions: batch.positions().to_vec(),
            logits: batch.logits().to_vec(),
        });
        Ok(())
    }

    fn sample(&mut self) -> Result<TokenId> {
        if !self.logits_ready {
            return Err(EngineError::Sampling(
                "no logits requested for the last decoded position".to_string(),
            ));
        }
        self.logits_ready = false;
        let token = self
            .reply
            .get(self.reply_cursor)
            .copied()
            .unwrap_or(EOS_TOKEN);
        self.reply_cursor += 1;
        self.last_sampled = Some(token);
        Ok(token)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_TOKEN
    }

    fn used_cells(&self) -> usize {
        self.cells.len()
    }

    fn capacity(&self) -> usize {
        self.window
    }

    fn clear_cache(&mut self) {
        self.cells.clear();
        self.logits_ready = false;
        self.last_sampled = None;
    }
}
