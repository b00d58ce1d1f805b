//! Release-and-wait reference counter.
//!
//! Both `Binding` teardown and `Datapath` teardown need the same shape: keep
//! a live count of in-flight references (outstanding callbacks, child
//! bindings), allow `acquire`/`release` from any thread, and let exactly one
//! thread block until the count reaches zero and no new references can be
//! acquired afterwards.

use std::sync::{Condvar, Mutex};

struct State {
    count: isize,
    shutting_down: bool,
}

/// `count` starts at 1 (an implicit reference held by the owner until
/// `release_and_wait` is called) and is decremented back to zero by matching
/// `release` calls plus the final `release_and_wait`.
///
/// `count` and `shutting_down` live behind one mutex so a `release` that
/// drops the count to zero can never interleave with `release_and_wait`'s
/// check-then-park — that interleaving is a lost wakeup (the notify fires
/// before the waiter is registered with the condvar) and would leave
/// `release_and_wait` blocked forever.
pub struct Rundown {
    state: Mutex<State>,
    drained: Condvar,
}

impl Rundown {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                count: 1,
                shutting_down: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Attempts to acquire a reference. Fails once `release_and_wait` has
    /// been called, even if the count has not yet reached zero.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return false;
        }
        state.count += 1;
        true
    }

    /// Releases one reference, waking a waiter if the count drops to zero.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.count -= 1;
        debug_assert!(state.count >= 0, "rundown released more times than acquired");
        if state.count == 0 {
            self.drained.notify_all();
        }
    }

    /// Marks the rundown as shutting down (no further `acquire` succeeds),
    /// releases the implicit initial reference, and blocks until every
    /// outstanding reference has been released.
    pub fn release_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        state.count -= 1;
        debug_assert!(state.count >= 0, "rundown released more times than acquired");
        let _unused = self.drained.wait_while(state, |s| s.count > 0).unwrap();
    }
}

impl Default for Rundown {
    fn default() -> Self {
        Self::new()
    }
}
