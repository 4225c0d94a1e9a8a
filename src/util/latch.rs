//! One-shot completion signals.
//!
//! A [CountDownLatch] starts with a count, is released when the count reaches zero, and can be
//!  aborted (e.g. on shutdown) to release waiters without signalling success. Waiting after the
//!  fact returns immediately, so signalling never depends on somebody waiting at that moment.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchState {
    Waiting(usize),
    Released,
    Aborted,
}
impl LatchState {
    fn for_count(count: usize) -> LatchState {
        if count == 0 {
            LatchState::Released
        }
        else {
            LatchState::Waiting(count)
        }
    }

    fn is_final(&self) -> bool {
        !matches!(self, LatchState::Waiting(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Released,
    Aborted,
    TimedOut,
}

pub struct CountDownLatch {
    state: watch::Sender<LatchState>,
}

impl CountDownLatch {
    pub fn new(count: usize) -> CountDownLatch {
        let (state, _) = watch::channel(LatchState::for_count(count));
        CountDownLatch { state }
    }

    pub fn state(&self) -> LatchState {
        *self.state.borrow()
    }

    /// re-arms a latch that has not reached a final state yet, replacing its count
    pub fn reset(&self, count: usize) {
        self.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            *state = LatchState::for_count(count);
            true
        });
    }

    pub fn count_down(&self) {
        self.state.send_if_modified(|state| match *state {
            LatchState::Waiting(n) => {
                *state = LatchState::for_count(n - 1);
                true
            }
            _ => false,
        });
    }

    /// releases all waiters with [WaitOutcome::Aborted] - a no-op if the latch was released
    ///  before
    pub fn abort(&self) {
        self.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            *state = LatchState::Aborted;
            true
        });
    }

    pub async fn wait(&self) -> WaitOutcome {
        let mut receiver = self.state.subscribe();
        let outcome = match receiver.wait_for(LatchState::is_final).await {
            Ok(state) if *state == LatchState::Released => WaitOutcome::Released,
            _ => WaitOutcome::Aborted,
        };
        outcome
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        match time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
