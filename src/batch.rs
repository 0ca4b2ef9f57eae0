//! Decode batch construction.
//!
//! One [`Batch`] is allocated per session and reused for every decode call;
//! building a new batch only resets its row count.

use llama_engine::{Batch, Pos, SeqId, TokenId};
use llama_kv::KVError;

use crate::error::{ChatError, Result};

/// Which entries of a batch request logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogitsMode {
    /// Only the final entry: prompt prefill.
    Last,
    /// Every entry: single-token generation steps.
    All,
}

/// Fills the session's reusable batch.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    batch: Batch,
    sequence_id: SeqId,
}

impl BatchBuilder {
    pub fn new(capacity: usize, max_sequences: usize, sequence_id: SeqId) -> Self {
        Self {
            batch: Batch::new(capacity, max_sequences),
            sequence_id,
        }
    }

    pub fn capacity(&self) -> usize {
        self.batch.capacity()
    }

    pub fn sequence_id(&self) -> SeqId {
        self.sequence_id
    }

    /// The batch as last built.
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Prompt tokens at consecutive positions from `start`, logits on the last.
    pub fn prefill(&mut self, tokens: &[TokenId], start: usize) -> Result<&Batch> {
        self.build(tokens, start, self.sequence_id, LogitsMode::Last)
    }

    /// One generated token at `position`.
    pub fn generation_step(&mut self, token: TokenId, position: usize) -> Result<&Batch> {
        self.build(&[token], position, self.sequence_id, LogitsMode::All)
    }

    /// Fill the batch with `tokens` at positions `start..start + tokens.len()`.
    ///
    /// # Errors
    /// - `EmptyPrompt`: no tokens
    /// - `BatchOverflow`: more tokens than the batch holds; the batch is left empty
    /// - `Kv(PositionOverflow)`: a position does not fit the engine's position type
    pub fn build(
        &mut self,
        tokens: &[TokenId],
        start: usize,
        sequence_id: SeqId,
        logits: LogitsMode,
    ) -> Result<&Batch> {
        self.batch.clear();
        if tokens.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if tokens.len() > self.batch.capacity() {
            return Err(ChatError::BatchOverflow {
                tokens: tokens.len(),
                capacity: self.batch.capacity(),
            });
        }

        let seq = [sequence_id];
        for (i, &token) in tokens.iter().enumerate() {
            let position = start + i;
            let pos = Pos::try_from(position).map_err(|_| KVError::PositionOverflow(position))?;
            self.batch
                .add(token, pos, &seq, logits == LogitsMode::All)?;
        }
        if logits == LogitsMode::Last {
            self.batch.request_last_logits()?;
        }
        Ok(&self.batch)
    }

    pub fn clear(&mut self) {
        self.batch.clear();
    }
}
