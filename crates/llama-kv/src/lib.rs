//! # llama-kv
//!
//! KV cache cell accounting for llama-chat.
//!
//! The cache tensors live inside the engine; this crate keeps the session's view
//! of them:
//! - **Capacity**: [`CapacityTracker`] knows the fixed window size and how many
//!   cells are occupied, and answers whether a request fits
//! - **Positions**: [`PositionCursor`] is the explicit counter handle for the next
//!   unused position, threaded through generation steps
//!
//! Both only move forward until an explicit `clear()`.

use std::fmt;

/// Error type for cell accounting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {required} > {capacity}")]
    CapacityExceeded { required: usize, capacity: usize },

    #[error("position counter overflow at {0}")]
    PositionOverflow(usize),
}

pub type KVResult<T> = Result<T, KVError>;

/// Whether `incoming` new tokens plus a reserve of `max_new_tokens` generated
/// tokens fit on top of `used` cells in a window of `capacity` cells.
///
/// Pure predicate; arithmetic overflow counts as not fitting.
pub fn fits(used: usize, incoming: usize, max_new_tokens: usize, capacity: usize) -> bool {
    CapacityRequest::new(used, incoming, max_new_tokens)
        .required()
        .is_some_and(|required| required <= capacity)
}

/// The three terms of a capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityRequest {
    pub used: usize,
    pub incoming: usize,
    pub max_new_tokens: usize,
}

impl CapacityRequest {
    pub fn new(used: usize, incoming: usize, max_new_tokens: usize) -> Self {
        Self {
            used,
            incoming,
            max_new_tokens,
        }
    }

    /// Cells needed to hold the request, `None` on overflow.
    pub fn required(&self) -> Option<usize> {
        self.used
            .checked_add(self.incoming)?
            .checked_add(self.max_new_tokens)
    }
}

impl fmt::Display for CapacityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used {} + incoming {} + reserve {}",
            self.used, self.incoming, self.max_new_tokens
        )
    }
}

/// Tracks occupied cells against a fixed context window.
///
/// # Invariants
/// - `used <= capacity` at all times
/// - `used` never decreases except through `clear()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityTracker {
    capacity: usize,
    used: usize,
}

impl CapacityTracker {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cells still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// [`fits`] against the tracker's current state.
    pub fn fits(&self, incoming: usize, max_new_tokens: usize) -> bool {
        fits(self.used, incoming, max_new_tokens, self.capacity)
    }

    /// Check a request, reporting the shortfall as an error.
    pub fn check(&self, incoming: usize, max_new_tokens: usize) -> KVResult<()> {
        let request = CapacityRequest::new(self.used, incoming, max_new_tokens);
        match request.required() {
            Some(required) if required <= self.capacity => Ok(()),
            required => Err(KVError::CapacityExceeded {
                required: required.unwrap_or(usize::MAX),
                capacity: self.capacity,
            }),
        }
    }

    /// Record `n` newly decoded cells.
    ///
    /// # Errors
    /// - `CapacityExceeded`: if the window cannot hold them; `used` is unchanged
    pub fn commit(&mut self, n: usize) -> KVResult<()> {
        self.check(n, 0)?;
        self.used += n;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl fmt::Display for CapacityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} cells", self.used, self.capacity)
    }
}

/// Cursor for the next unused position in the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionCursor {
    next: usize,
}

impl PositionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next: usize) -> Self {
        Self { next }
    }

    pub fn get(&self) -> usize {
        self.next
    }

    /// Next position as the engine's signed position type.
    pub fn as_pos(&self) -> KVResult<i32> {
        i32::try_from(self.next).map_err(|_| KVError::PositionOverflow(self.next))
    }

    /// Move the cursor to `next`. Positions never move backwards.
    pub fn seek(&mut self, next: usize) {
        debug_assert!(next >= self.next, "position cursor moved backwards");
        self.next = next;
    }

    pub fn advance(&mut self, n: usize) -> KVResult<()> {
        self.next = self
            .next
            .checked_add(n)
            .ok_or(KVError::PositionOverflow(self.next))?;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_at_exact_capacity() {
        assert!(fits(0, 2000, 48, 2048));
        assert!(!fits(0, 2000, 49, 2048));
    }

    #[test]
    fn fits_overflow_is_false() {
        assert!(!fits(usize::MAX, 1, 0, usize::MAX));
    }

    #[test]
    fn request_display() {
        let req = CapacityRequest::new(50, 10, 20);
        assert_eq!(req.required(), Some(80));
        assert_eq!(req.to_string(), "used 50 + incoming 10 + reserve 20");
    }

    #[test]
    fn tracker_commit_and_clear() {
        let mut tracker = CapacityTracker::new(10);
        assert!(tracker.is_empty());
        tracker.commit(4).unwrap();
        tracker.commit(6).unwrap();
        assert_eq!(tracker.used(), 10);
        assert_eq!(tracker.remaining(), 0);

        tracker.clear();
        assert_eq!(tracker.used(), 0);
        assert_eq!(tracker.capacity(), 10);
    }

    #[test]
    fn tracker_commit_past_capacity_errors_without_mutation() {
        let mut tracker = CapacityTracker::new(8);
        tracker.commit(5).unwrap();
        assert_eq!(
            tracker.commit(4).unwrap_err(),
            KVError::CapacityExceeded {
                required: 9,
                capacity: 8
            }
        );
        assert_eq!(tracker.used(), 5);
    }

    #[test]
    fn tracker_check_includes_reserve() {
        let mut tracker = CapacityTracker::new(200);
        tracker.commit(50).unwrap();
        assert!(tracker.fits(10, 20));
        assert!(tracker.check(10, 140).is_ok());
        assert_eq!(
            tracker.check(10, 141).unwrap_err(),
            KVError::CapacityExceeded {
                required: 201,
                capacity: 200
            }
        );
    }

    #[test]
    fn tracker_display() {
        let mut tracker = CapacityTracker::new(2048);
        tracker.commit(12).unwrap();
        assert_eq!(tracker.to_string(), "12/2048 cells");
    }

    #[test]
    fn cursor_advances_and_resets() {
        let mut cursor = PositionCursor::starting_at(50);
        cursor.advance(10).unwrap();
        assert_eq!(cursor.get(), 60);
        assert_eq!(cursor.as_pos().unwrap(), 60);
        cursor.reset();
        assert_eq!(cursor.get(), 0);
    }

    #[test]
    fn cursor_position_overflow() {
        let cursor = PositionCursor::starting_at(i32::MAX as usize + 1);
        assert!(matches!(cursor.as_pos(), Err(KVError::PositionOverflow(_))));
        let mut cursor = PositionCursor::starting_at(usize::MAX);
        assert!(cursor.advance(1).is_err());
    }
}
