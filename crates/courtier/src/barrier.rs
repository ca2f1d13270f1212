use std::sync::{Condvar, Mutex, PoisonError};

/// A reusable barrier for a fixed number of cooperating threads.
///
/// Execution blocks until the required number of threads has called
/// [`wait`](Self::wait); the last arrival advances the internal generation
/// counter and releases everyone. The barrier resets itself and can be used
/// again for the next batch. Exactly one caller per generation — the releaser
/// — receives `true`.
///
/// Used by batch-style evaluation phases that need a fence between rounds.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
    count_start: u32,
}

struct BarrierState {
    count: u32,
    generation: u32,
}

impl Barrier {
    /// Creates a barrier for `count` participants.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn new(count: u32) -> Self {
        assert!(count > 0, "barrier participant count cannot be 0");
        Self {
            state: Mutex::new(BarrierState {
                count,
                generation: 0,
            }),
            cond: Condvar::new(),
            count_start: count,
        }
    }

    /// Blocks until all participants have arrived. Returns `true` for the
    /// releaser, `false` for everyone else.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation;

        state.count -= 1;
        if state.count == 0 {
            state.generation = state.generation.wrapping_add(1);
            state.count = self.count_start;
            drop(state);
            self.cond.notify_all();
            return true;
        }

        let _state = self
            .cond
            .wait_while(state, |s| generation == s.generation)
            .unwrap_or_else(PoisonError::into_inner);
        false
    }
}
