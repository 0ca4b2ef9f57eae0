//! Streaming UTF-8 assembly of detokenized bytes.
//!
//! A token's bytes can end in the middle of a character. [`StreamAssembler`]
//! buffers such a tail until the continuation bytes arrive and only ever hands
//! out complete, well-formed text.

/// Error type for stream assembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The buffer contained bytes that can never become valid UTF-8.
    /// `text` holds the well-formed text around them, `invalid` the dropped bytes.
    #[error("malformed UTF-8 in token stream: {invalid:02x?}")]
    Malformed { text: String, invalid: Vec<u8> },
}

/// Accumulates byte fragments and releases well-formed UTF-8 chunks.
///
/// # Invariants
/// - `pending` holds at most one incomplete character (3 bytes) between calls
/// - Concatenating every emitted chunk reproduces the input text exactly
#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    pending: Vec<u8>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `fragment` and return all text that is now complete.
    ///
    /// Returns an empty string while a multi-byte character is still incomplete.
    ///
    /// # Errors
    /// - `Malformed`: the buffer holds a byte sequence that is not a valid prefix
    ///   of any character. Those bytes are discarded; the error carries the
    ///   surrounding text so nothing valid is lost.
    pub fn push(&mut self, fragment: &[u8]) -> Result<String, StreamError> {
        self.pending.extend_from_slice(fragment);

        let mut text = String::new();
        let mut invalid = Vec::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    text.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(valid) {
                        text.push_str(s);
                    }
                    match e.error_len() {
                        Some(n) => {
                            invalid.extend_from_slice(&after[..n]);
                            rest = &after[n..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;

        if invalid.is_empty() {
            Ok(text)
        } else {
            Err(StreamError::Malformed { text, invalid })
        }
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take whatever incomplete bytes remain, leaving the assembler empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
