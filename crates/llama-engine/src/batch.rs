//! Pre-sized token batch submitted to [`LlamaEngine::decode`](crate::LlamaEngine::decode).
//!
//! Storage is laid out column-wise (token, position, sequence ids, logits flag),
//! allocated once for `capacity` rows and `max_sequences` ids per row. [`Batch::clear`]
//! only resets the row count, so one batch can serve a whole session's prefill
//! and every generation step without reallocating.

use crate::{Pos, SeqId, TokenId};

/// Error type for batch construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("batch is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("token belongs to {got} sequences, batch allows {max}")]
    TooManySequences { got: usize, max: usize },

    #[error("token must belong to at least one sequence")]
    NoSequence,

    #[error("position {pos} does not follow {prev}")]
    PositionOrder { prev: Pos, pos: Pos },

    #[error("batch is empty")]
    Empty,
}

/// Borrowed view of one batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub token: TokenId,
    pub pos: Pos,
    pub seq_ids: &'a [SeqId],
    pub logits: bool,
}

#[derive(Debug, Clone)]
pub struct Batch {
    tokens: Vec<TokenId>,
    pos: Vec<Pos>,
    n_seq: Vec<usize>,
    seq_ids: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    n_tokens: usize,
    max_sequences: usize,
}

impl Batch {
    /// Allocate a batch holding up to `capacity` tokens, each belonging to at
    /// most `max_sequences` sequences.
    pub fn new(capacity: usize, max_sequences: usize) -> Self {
        let max_sequences = max_sequences.max(1);
        Self {
            tokens: vec![0; capacity],
            pos: vec![0; capacity],
            n_seq: vec![0; capacity],
            seq_ids: (0..capacity).map(|_| vec![0; max_sequences]).collect(),
            logits: vec![false; capacity],
            n_tokens: 0,
            max_sequences,
        }
    }

    /// Append one token.
    ///
    /// # Errors
    /// - `Full`: the batch already holds `capacity` tokens
    /// - `NoSequence` / `TooManySequences`: `seq_ids` is empty or too long
    /// - `PositionOrder`: `pos` is not greater than the previous row's position
    pub fn add(&mut self, token: TokenId, pos: Pos, seq_ids: &[SeqId], logits: bool) -> Result<(), BatchError> {
        if self.n_tokens >= self.capacity() {
            return Err(BatchError::Full {
                capacity: self.capacity(),
            });
        }
        if seq_ids.is_empty() {
            return Err(BatchError::NoSequence);
        }
        if seq_ids.len() > self.max_sequences {
            return Err(BatchError::TooManySequences {
                got: seq_ids.len(),
                max: self.max_sequences,
            });
        }
        if let Some(prev) = self.last_pos() {
            if pos <= prev {
                return Err(BatchError::PositionOrder { prev, pos });
            }
        }

        let i = self.n_tokens;
        self.tokens[i] = token;
        self.pos[i] = pos;
        self.n_seq[i] = seq_ids.len();
        self.seq_ids[i][..seq_ids.len()].copy_from_slice(seq_ids);
        self.logits[i] = logits;
        self.n_tokens += 1;
        Ok(())
    }

    /// Request logits for the last row.
    pub fn request_last_logits(&mut self) -> Result<(), BatchError> {
        match self.n_tokens {
            0 => Err(BatchError::Empty),
            n => {
                self.logits[n - 1] = true;
                Ok(())
            }
        }
    }

    /// Reset the row count; storage is kept.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Maximum number of rows.
    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    pub fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    pub fn get(&self, i: usize) -> Option<BatchEntry<'_>> {
        if i >= self.n_tokens {
            return None;
        }
        Some(BatchEntry {
            token: self.tokens[i],
            pos: self.pos[i],
            seq_ids: &self.seq_ids[i][..self.n_seq[i]],
            logits: self.logits[i],
        })
    }

    pub fn last(&self) -> Option<BatchEntry<'_>> {
        self.n_tokens.checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn entries(&self) -> impl Iterator<Item = BatchEntry<'_>> + '_ {
        (0..self.n_tokens).filter_map(move |i| self.get(i))
    }

    /// Tokens of the filled rows.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens[..self.n_tokens]
    }

    /// Positions of the filled rows.
    pub fn positions(&self) -> &[Pos] {
        &self.pos[..self.n_tokens]
    }

    /// Logits flags of the filled rows.
    pub fn logits(&self) -> &[bool] {
        &self.logits[..self.n_tokens]
    }

    /// Number of rows requesting logits.
    pub fn n_outputs(&self) -> usize {
        self.logits().iter().filter(|&&l| l).count()
    }

    fn last_pos(&self) -> Option<Pos> {
        self.n_tokens.checked_sub(1).map(|i| self.pos[i])
    }
}
