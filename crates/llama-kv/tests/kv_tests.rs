//! Integration tests for llama-kv.
//!
//! Validates:
//! - Capacity monotonicity: turns that individually fit never overrun the window
//! - Boundary conditions of the fit predicate
//! - Cursor and tracker stay in lockstep through prefill + decode
//! - Clear is idempotent

use llama_kv::*;

// ===========================================================================
// Capacity monotonicity
// ===========================================================================

/// Deterministic xorshift so the sequences below are reproducible.
fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

#[test]
fn capacity_monotonicity_for_turns_that_fit() {
    for seed in 1..=64u64 {
        let mut rng = seed;
        let capacity = 64 + (next(&mut rng) % 512) as usize;
        let mut tracker = CapacityTracker::new(capacity);
        let mut previous = 0;

        for _ in 0..100 {
            let incoming = (next(&mut rng) % 40) as usize;
            let max_new = (next(&mut rng) % 40) as usize;
            if !tracker.fits(incoming, max_new) {
                continue;
            }
            tracker.commit(incoming).unwrap();
            // Generation consumes at most the reserved budget.
            let generated = (next(&mut rng) % (max_new as u64 + 1)) as usize;
            tracker.commit(generated).unwrap();

            assert!(tracker.used() <= tracker.capacity());
            assert!(tracker.used() >= previous, "used cells decreased");
            previous = tracker.used();
        }
    }
}

#[test]
fn fit_predicate_agrees_with_tracker() {
    let mut tracker = CapacityTracker::new(100);
    tracker.commit(30).unwrap();
    for incoming in 0..80 {
        for max_new in 0..80 {
            assert_eq!(
                tracker.fits(incoming, max_new),
                fits(30, incoming, max_new, 100),
                "incoming={incoming} max_new={max_new}"
            );
            assert_eq!(
                tracker.fits(incoming, max_new),
                tracker.check(incoming, max_new).is_ok()
            );
        }
    }
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn scenario_prompt_plus_budget_over_window() {
    // 2000 prompt tokens + 100 reserved > 2048.
    let tracker = CapacityTracker::new(2048);
    assert!(!tracker.fits(2000, 100));
    assert_eq!(
        tracker.check(2000, 100).unwrap_err(),
        KVError::CapacityExceeded {
            required: 2100,
            capacity: 2048
        }
    );
}

#[test]
fn scenario_incremental_turn_after_prefill() {
    let mut tracker = CapacityTracker::new(200);
    let mut cursor = PositionCursor::new();

    tracker.commit(50).unwrap();
    cursor.advance(50).unwrap();

    assert!(tracker.fits(10, 20));
    let start = tracker.used();
    assert_eq!(start, 50);

    tracker.commit(10).unwrap();
    cursor.seek(start + 10);
    assert_eq!(tracker.used(), 60);
    assert_eq!(cursor.get(), 60);
}

#[test]
fn prefill_then_decode_keeps_cursor_and_tracker_in_lockstep() {
    let mut tracker = CapacityTracker::new(32);
    let mut cursor = PositionCursor::new();

    tracker.commit(8).unwrap();
    cursor.advance(8).unwrap();
    for _ in 0..10 {
        tracker.commit(1).unwrap();
        cursor.advance(1).unwrap();
        assert_eq!(tracker.used(), cursor.get());
    }
    assert_eq!(tracker.used(), 18);
}

// ===========================================================================
// Clear
// ===========================================================================

#[test]
fn clear_is_idempotent() {
    let mut tracker = CapacityTracker::new(16);
    let mut cursor = PositionCursor::new();
    tracker.commit(9).unwrap();
    cursor.advance(9).unwrap();

    for _ in 0..2 {
        tracker.clear();
        cursor.reset();
        assert_eq!(tracker.used(), 0);
        assert_eq!(cursor.get(), 0);
        assert_eq!(tracker.capacity(), 16);
    }
}

#[test]
fn error_display() {
    let err = KVError::CapacityExceeded {
        required: 2100,
        capacity: 2048,
    };
    assert_eq!(err.to_string(), "KV cache capacity exceeded: 2100 > 2048");
}
