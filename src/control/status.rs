//! Shared run status: thread accounting, progress and termination.
//!
//! One instance is shared by the controller, every worker thread and any
//! polling caller. Progress counters are atomics so polling never contends
//! with the workers; thread accounting and the run state live under a
//! mutex/condvar pair so completion waits cannot miss a wakeup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::domain::{CancellationToken, RunState};

pub struct FitStatus {
    n_region: AtomicUsize,
    processed: AtomicUsize,
    inner: Mutex<StatusInner>,
    cv: Condvar,
    token: CancellationToken,
}

struct StatusInner {
    threads_running: usize,
    state: RunState,
}

impl FitStatus {
    pub fn new() -> Self {
        Self {
            n_region: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            inner: Mutex::new(StatusInner {
                threads_running: 0,
                state: RunState::Idle,
            }),
            cv: Condvar::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn set_n_region(&self, n: usize) {
        self.n_region.store(n, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
    }

    pub fn reset_progress(&self) {
        self.processed.store(0, Ordering::SeqCst);
    }

    pub fn add_thread(&self) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.threads_running += 1;
    }

    /// Decrement the running-thread count; returns how many remain. The
    /// caller observing zero is the last one out and performs shared
    /// cleanup.
    pub fn remove_thread(&self) -> usize {
        let mut inner = self.inner.lock().expect("status lock");
        inner.threads_running = inner.threads_running.saturating_sub(1);
        let remaining = inner.threads_running;
        self.cv.notify_all();
        remaining
    }

    pub fn region_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Fraction of work units finished, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let n = self.n_region.load(Ordering::SeqCst);
        if n == 0 {
            return 0.0;
        }
        self.processed.load(Ordering::SeqCst) as f64 / n as f64
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: RunState) {
        let mut inner = self.inner.lock().expect("status lock");
        inner.state = state;
        self.cv.notify_all();
    }

    pub fn state(&self) -> RunState {
        self.inner.lock().expect("status lock").state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Block until the run leaves the `Running` state.
    pub fn wait_idle(&self) -> RunState {
        let mut inner = self.inner.lock().expect("status lock");
        while inner.state == RunState::Running {
            inner = self.cv.wait(inner).expect("status lock");
        }
        inner.state
    }

    /// Request cooperative termination.
    pub fn terminate(&self) {
        self.token.cancel();
        // Wake anyone parked on the completion wait; scheduler barriers
        // are woken by the controller, which owns their condvar.
        self.cv.notify_all();
    }

    pub fn is_terminating(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for FitStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_tracks_processed_regions() {
        let status = FitStatus::new();
        status.set_n_region(4);
        assert_eq!(status.progress(), 0.0);
        status.region_processed();
        status.region_processed();
        assert!((status.progress() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn thread_accounting_reports_last_one_out() {
        let status = FitStatus::new();
        status.add_thread();
        status.add_thread();
        assert_eq!(status.remove_thread(), 1);
        assert_eq!(status.remove_thread(), 0);
    }

    #[test]
    fn terminate_is_visible_through_the_token() {
        let status = FitStatus::new();
        let token = status.token();
        assert!(!token.is_cancelled());
        status.terminate();
        assert!(token.is_cancelled());
        assert!(status.is_terminating());
    }

    #[test]
    fn wait_idle_returns_immediately_when_not_running() {
        let status = FitStatus::new();
        assert_eq!(status.wait_idle(), RunState::Idle);
        status.set_state(RunState::Completed);
        assert_eq!(status.wait_idle(), RunState::Completed);
    }
}
