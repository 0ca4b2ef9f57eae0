//! Per-session mutable state: cell accounting, the position cursor and the
//! pending output bytes.

use llama_kv::{CapacityTracker, PositionCursor};
use llama_tokenizer::StreamAssembler;

use crate::error::Result;

/// Mutable bookkeeping owned by one session.
///
/// After every successful decode `used_cells == next_position`: the session
/// holds a single sequence whose positions start at 0 and have no gaps.
#[derive(Debug, Clone)]
pub struct SessionState {
    tracker: CapacityTracker,
    cursor: PositionCursor,
    stream: StreamAssembler,
}

impl SessionState {
    pub fn new(capacity: usize) -> Self {
        Self {
            tracker: CapacityTracker::new(capacity),
            cursor: PositionCursor::new(),
            stream: StreamAssembler::new(),
        }
    }

    pub fn tracker(&self) -> &CapacityTracker {
        &self.tracker
    }

    pub fn used_cells(&self) -> usize {
        self.tracker.used()
    }

    pub fn capacity(&self) -> usize {
        self.tracker.capacity()
    }

    pub fn next_position(&self) -> usize {
        self.cursor.get()
    }

    /// Bytes of an incomplete character waiting for the next token.
    pub fn pending_bytes(&self) -> &[u8] {
        self.stream.pending()
    }

    pub fn stream_mut(&mut self) -> &mut StreamAssembler {
        &mut self.stream
    }

    /// Record `n` cells decoded at positions `start..start + n`.
    pub fn commit(&mut self, start: usize, n: usize) -> Result<()> {
        debug_assert_eq!(start, self.cursor.get(), "decode did not continue the sequence");
        self.tracker.commit(n)?;
        self.cursor.seek(start);
        self.cursor.advance(n)?;
        Ok(())
    }

    /// Forget everything, as after a cache clear.
    pub fn clear(&mut self) {
        self.tracker.clear();
        self.cursor.reset();
        self.stream.reset();
    }
}
