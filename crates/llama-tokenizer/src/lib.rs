//! # llama-tokenizer
//!
//! Tokenization and streamed detokenization for llama-chat.
//!
//! This crate provides:
//! - A `Tokenizer` trait for pluggable tokenization backends
//! - A reference byte-level tokenizer with special-token markup for testing
//! - [`StreamAssembler`], which turns raw token bytes into well-formed UTF-8 chunks

mod stream;

pub use stream::{StreamAssembler, StreamError};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs. `add_special` prepends BOS, `parse_special`
    /// turns special-token markup into its token instead of plain bytes.
    fn encode(&self, text: &str, add_special: bool, parse_special: bool) -> TokenizerResult<Vec<i32>>;

    /// Raw bytes of one token. Multi-byte characters may span several tokens.
    fn token_bytes(&self, token: i32) -> TokenizerResult<Vec<u8>>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[i32]) -> TokenizerResult<String> {
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend(self.token_bytes(token)?);
        }
        String::from_utf8(bytes).map_err(|e| TokenizerError::DecodingError(e.to_string()))
    }

    /// Decode a single token through a stream assembler, returning whatever
    /// complete text became available.
    fn decode_token(&self, token: i32, stream: &mut StreamAssembler) -> TokenizerResult<String> {
        let bytes = self.token_bytes(token)?;
        Ok(stream.push(&bytes)?)
    }
}

/// Beginning-of-sequence token of [`ByteTokenizer`].
pub const BOS_TOKEN: i32 = 256;
/// End-of-sequence token of [`ByteTokenizer`].
pub const EOS_TOKEN: i32 = 257;

const BYTE_VOCAB: usize = 256;

/// Reference byte-level tokenizer.
///
/// - One token per byte (IDs 0..=255), so any UTF-8 text round-trips exactly
/// - Special tokens from 256 upwards: `<s>`, `</s>`, then ChatML markers
/// - Deterministic, no vocabulary file
///
/// Splitting multi-byte characters across tokens is the point: it exercises the
/// same streaming path a BPE byte-fallback vocabulary does.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    specials: Vec<String>,
}

impl ByteTokenizer {
    pub fn new() -> Self {
        Self {
            specials: ["<s>", "</s>", "<|im_start|>", "<|im_end|>"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Register an additional special token after the built-in ones.
    pub fn with_special(mut self, text: &str) -> Self {
        if !self.specials.iter().any(|s| s == text) {
            self.specials.push(text.to_string());
        }
        self
    }

    /// ID of a special token by its markup.
    pub fn special_id(&self, text: &str) -> Option<i32> {
        self.specials
            .iter()
            .position(|s| s == text)
            .map(|i| (BYTE_VOCAB + i) as i32)
    }

    pub fn is_special(&self, token: i32) -> bool {
        token >= BYTE_VOCAB as i32 && (token as usize) < BYTE_VOCAB + self.specials.len()
    }

    /// Longest special marker starting at the beginning of `rest`.
    fn match_special(&self, rest: &str) -> Option<(usize, i32)> {
        self.specials
            .iter()
            .enumerate()
            .filter(|(_, s)| rest.starts_with(s.as_str()))
            .max_by_key(|(_, s)| s.len())
            .map(|(i, s)| (s.len(), (BYTE_VOCAB + i) as i32))
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_special: bool, parse_special: bool) -> TokenizerResult<Vec<i32>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(BOS_TOKEN);
        }

        if !parse_special {
            ids.extend(text.bytes().map(i32::from));
            return Ok(ids);
        }

        let mut i = 0;
        while i < text.len() {
            // Markers are ASCII, so a match always starts on a char boundary.
            if let Some((len, id)) = text.get(i..).and_then(|rest| self.match_special(rest)) {
                ids.push(id);
                i += len;
            } else {
                ids.push(i32::from(text.as_bytes()[i]));
                i += 1;
            }
        }
        Ok(ids)
    }

    fn token_bytes(&self, token: i32) -> TokenizerResult<Vec<u8>> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            t if self.is_special(t) => Ok(self.specials[t as usize - BYTE_VOCAB].as_bytes().to_vec()),
            t => Err(TokenizerError::InvalidToken(t)),
        }
    }

    fn vocab_size(&self) -> usize {
        BYTE_VOCAB + self.specials.len()
    }
}
