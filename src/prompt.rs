//! Chat template rendering.
//!
//! Templates are applied by the engine into a caller-provided buffer. When the
//! rendered text is longer than the buffer the engine reports the required
//! length; the buffer is grown and the template applied again.
//!
//! For incremental turns only the text up to and including the last assistant
//! marker is submitted: that prefix carries the generation cue, and anything a
//! template appends after it would otherwise end up in the cache.

use std::fmt;

use llama_engine::{ChatTurn, LlamaEngine};

use crate::config::SessionConfig;
use crate::error::{ChatError, Result};

/// Finds where the assistant-generation cue ends in rendered template text.
pub trait BoundaryLocator: fmt::Debug + Send + Sync {
    /// Byte offset just past the cue, `None` if the text has none.
    fn locate(&self, rendered: &str) -> Option<usize>;
}

/// Locates the last occurrence of a role marker such as `"assistant"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMarker {
    marker: String,
}

impl RoleMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl BoundaryLocator for RoleMarker {
    fn locate(&self, rendered: &str) -> Option<usize> {
        rendered
            .rfind(&self.marker)
            .map(|start| start + self.marker.len())
    }
}

/// Rendered template text and the end of its assistant cue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub text: String,
    pub boundary: Option<usize>,
}

impl RenderedPrompt {
    /// Text to submit for an incremental turn: the prefix through the cue, or
    /// the whole text when no cue was found.
    pub fn incremental_segment(&self) -> &str {
        self.boundary
            .and_then(|end| self.text.get(..end))
            .unwrap_or(&self.text)
    }
}

/// Renders transcripts through the engine's chat template.
#[derive(Debug)]
pub struct PromptFormatter {
    locator: Box<dyn BoundaryLocator>,
    turn_buffer_bytes: usize,
    transcript_buffer_bytes: usize,
}

impl PromptFormatter {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            locator: Box::new(RoleMarker::new(config.assistant_marker.clone())),
            turn_buffer_bytes: config.template_buffer_bytes,
            transcript_buffer_bytes: config.context_size,
        }
    }

    /// Replace the boundary rule, e.g. for templates whose cue is not a role name.
    pub fn with_locator(mut self, locator: impl BoundaryLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    /// Render the whole transcript followed by the assistant cue.
    pub fn format<E: LlamaEngine + ?Sized>(
        &self,
        engine: &E,
        turns: &[ChatTurn],
    ) -> Result<RenderedPrompt> {
        let text = render(engine, turns, true, self.transcript_buffer_bytes)?;
        let boundary = self.locate(&text);
        Ok(RenderedPrompt { text, boundary })
    }

    /// Render a single new turn followed by the assistant cue.
    pub fn format_turn<E: LlamaEngine + ?Sized>(
        &self,
        engine: &E,
        turn: &ChatTurn,
    ) -> Result<RenderedPrompt> {
        let text = render(engine, std::slice::from_ref(turn), true, self.turn_buffer_bytes)?;
        let boundary = self.locate(&text);
        if boundary.is_none() {
            tracing::warn!("assistant cue not found in rendered turn, submitting full text");
        }
        Ok(RenderedPrompt { text, boundary })
    }

    /// Offsets outside the text or inside a character count as no cue.
    fn locate(&self, text: &str) -> Option<usize> {
        let end = self.locator.locate(text)?;
        if text.is_char_boundary(end) {
            Some(end)
        } else {
            tracing::warn!(
                offset = end,
                len = text.len(),
                "boundary locator returned an invalid offset"
            );
            None
        }
    }
}

/// Apply the engine's chat template, growing the buffer once if needed.
///
/// # Errors
/// - `TemplateFailure`: the engine reported a negative length, or the second
///   pass still did not fit
/// - `TemplateEncoding`: the rendered bytes are not UTF-8
pub fn render<E: LlamaEngine + ?Sized>(
    engine: &E,
    turns: &[ChatTurn],
    add_assistant: bool,
    initial_bytes: usize,
) -> Result<String> {
    let mut buf = vec![0u8; initial_bytes.max(1)];
    let mut len = required_len(engine.apply_chat_template(turns, add_assistant, &mut buf))?;

    if len > buf.len() {
        tracing::debug!(from = buf.len(), to = len, "growing template buffer");
        buf.resize(len, 0);
        let code = engine.apply_chat_template(turns, add_assistant, &mut buf);
        len = required_len(code)?;
        if len > buf.len() {
            return Err(ChatError::TemplateFailure { code });
        }
    }

    buf.truncate(len);
    Ok(String::from_utf8(buf)?)
}

fn required_len(code: i32) -> Result<usize> {
    usize::try_from(code).map_err(|_| ChatError::TemplateFailure { code })
}
