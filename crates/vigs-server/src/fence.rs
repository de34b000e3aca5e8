//! Fence acknowledgement tracking.
//!
//! Batches complete on the render thread, captures complete on the display path, so acks can
//! arrive out of order. The guest only ever sees a contiguous `[lower, upper]` window: acks are
//! collected into disjoint ranges that merge as gaps fill, and each register read pops the
//! oldest range.
//!
//! Sequence numbers live in a 32-bit space that wraps and skips 0 (0 means "no fence").

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{error, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceRange {
    pub lower: u32,
    pub upper: u32,
}

impl FenceRange {
    fn single(seq: u32) -> Self {
        Self {
            lower: seq,
            upper: seq,
        }
    }
}

pub fn seq_next(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

pub fn seq_prev(seq: u32) -> u32 {
    match seq.wrapping_sub(1) {
        0 => u32::MAX,
        prev => prev,
    }
}

/// Wraparound-safe `a < b`.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[derive(Debug, Default)]
struct FenceState {
    acks: VecDeque<FenceRange>,
    last_upper: u32,
}

#[derive(Debug, Default)]
pub struct FenceManager {
    state: Mutex<FenceState>,
}

impl FenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FenceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drops every pending range. The last popped upper bound is kept.
    pub fn reset(&self) {
        self.lock().acks.clear();
    }

    pub fn ack(&self, fence_seq: u32) {
        trace!(fence_seq, "fence ack");

        if fence_seq == 0 {
            error!("fence ack with reserved sequence 0");
            return;
        }

        let mut state = self.lock();
        let acks = &mut state.acks;

        for i in 0..acks.len() {
            let upper_p1 = seq_next(acks[i].upper);

            if upper_p1 == fence_seq {
                acks[i].upper = fence_seq;

                if let Some(next) = acks.get(i + 1).copied() {
                    if next.lower == seq_next(fence_seq) {
                        acks[i].upper = next.upper;
                        acks.remove(i + 1);
                    }
                }
                return;
            }

            if seq_before(fence_seq, upper_p1) {
                let lower_m1 = seq_prev(acks[i].lower);

                if lower_m1 == fence_seq {
                    acks[i].lower = fence_seq;
                } else if seq_before(fence_seq, lower_m1) {
                    acks.insert(i, FenceRange::single(fence_seq));
                } else {
                    error!(fence_seq, "duplicate fence ack");
                }
                return;
            }
        }

        acks.push_back(FenceRange::single(fence_seq));
    }

    /// Pops the oldest range, returning its lower bound (0 when nothing is pending). The range's
    /// upper bound becomes the value reported by [`FenceManager::get_upper`].
    pub fn get_lower(&self) -> u32 {
        let mut state = self.lock();
        match state.acks.pop_front() {
            Some(range) => {
                state.last_upper = range.upper;
                range.lower
            }
            None => 0,
        }
    }

    pub fn get_upper(&self) -> u32 {
        self.lock().last_upper
    }

    pub fn pending(&self) -> bool {
        !self.lock().acks.is_empty()
    }

    /// Snapshot of the pending ranges, oldest first.
    pub fn ranges(&self) -> Vec<FenceRange> {
        self.lock().acks.iter().copied().collect()
    }
}
