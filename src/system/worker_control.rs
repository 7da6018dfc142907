//! Stop / release / reset / finish handshake shared between a worker thread
//! and the threads that control it.
//!
//! The controller side requests, the worker side acknowledges. Every change
//! notifies the condition variable so waiters wake immediately instead of
//! sleeping through a poll interval.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ControlState {
    stop_requested: bool,
    stopped: bool,
    reset_requested: bool,
    finish_requested: bool,
    finished: bool,
}

#[derive(Debug, Default)]
pub struct WorkerControl {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Controller side
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.stop_requested = true;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Resume a stopped worker. No effect once the worker finished.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.stop_requested = false;
        state.stopped = false;
        self.changed.notify_all();
    }

    /// Ask the worker to drop its queued input and per-session state.
    /// No effect once the worker finished.
    pub fn request_reset(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.reset_requested = true;
        self.changed.notify_all();
    }

    /// Block until the worker acknowledged the pending reset. Returns at once
    /// if the worker finished instead.
    pub fn wait_until_reset(&self) {
        let mut state = self.state.lock();
        while state.reset_requested && !state.finished {
            self.changed.wait(&mut state);
        }
    }

    pub fn request_finish(&self) {
        let mut state = self.state.lock();
        state.finish_requested = true;
        self.changed.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn wait_until_stopped(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            self.changed.wait(&mut state);
        }
    }

    pub fn wait_until_finished(&self) {
        let mut state = self.state.lock();
        while !state.finished {
            self.changed.wait(&mut state);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Worker side
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_finish_requested(&self) -> bool {
        self.state.lock().finish_requested
    }

    /// Acknowledge a pending stop request. Returns true if the worker is now
    /// stopped and should call [`WorkerControl::wait_while_stopped`].
    pub fn stop_if_requested(&self) -> bool {
        let mut state = self.state.lock();
        if state.stop_requested && !state.finish_requested {
            state.stopped = true;
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_reset_requested(&self) -> bool {
        self.state.lock().reset_requested
    }

    /// Called by the worker once its queue and state are cleared.
    pub fn acknowledge_reset(&self) {
        let mut state = self.state.lock();
        state.reset_requested = false;
        self.changed.notify_all();
    }

    /// Park the worker until it is released, asked to reset or asked to
    /// finish. A stopped worker stays stopped across a reset.
    pub fn wait_while_stopped(&self) {
        let mut state = self.state.lock();
        while state.stopped && !state.reset_requested && !state.finish_requested {
            self.changed.wait(&mut state);
        }
    }

    /// Mark the worker as finished. A finished worker also counts as stopped.
    pub fn set_finished(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        state.stopped = true;
        self.changed.notify_all();
    }
}
