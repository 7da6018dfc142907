//! Contracts of the long-running workers the orchestrator drives.
//!
//! Stop and finish are cooperative: a worker polls its own flags and may
//! take arbitrarily long to honor them. Waiting is unbounded. The default
//! `wait_*` methods poll at the interval they are given; implementations
//! with a condition variable override them to wake as soon as the state
//! changes.

use std::time::Duration;

/// Block until `done` returns true, checking every `interval`.
///
/// `done` is evaluated once per poll, so a combined condition observes all
/// of its parts in the same poll.
pub fn poll_until(interval: Duration, mut done: impl FnMut() -> bool) {
    while !done() {
        std::thread::sleep(interval);
    }
}

/// Local Mapping worker as seen by the orchestrator and by Tracking.
pub trait LocalMapping: Send + Sync {
    /// Ask the worker to pause after its current keyframe.
    fn request_stop(&self);

    fn is_stopped(&self) -> bool;

    /// Resume a stopped worker.
    fn release(&self);

    fn request_finish(&self);

    fn is_finished(&self) -> bool;

    fn wait_until_stopped(&self, poll: Duration) {
        poll_until(poll, || self.is_stopped());
    }

    /// Drop every queued keyframe and return once the worker has done so.
    /// Workers that hold no per-session state keep the default.
    fn reset(&self) {}
}

/// Loop Closing worker.
pub trait LoopClosing: Send + Sync {
    fn request_finish(&self);

    fn is_finished(&self) -> bool;

    /// True while a global bundle adjustment launched by a loop closure is
    /// still running.
    fn is_running_gba(&self) -> bool;

    /// Drop queued keyframes and loop candidates, blocking until done.
    fn reset(&self) {}
}

/// Viewer worker.
pub trait Viewer: Send + Sync {
    fn request_finish(&self);

    fn is_finished(&self) -> bool;

    /// Rebind the viewer's exclusive rendering context to the calling thread.
    /// Only called once the viewer has reported finished.
    fn bind_render_context(&self) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_poll_until_counts_polls() {
        let calls = AtomicUsize::new(0);
        poll_until(Duration::from_micros(10), || {
            calls.fetch_add(1, Ordering::SeqCst) >= 2
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct SlowStop {
        polls: AtomicUsize,
    }

    impl LocalMapping for SlowStop {
        fn request_stop(&self) {}
        fn is_stopped(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= 4
        }
        fn release(&self) {}
        fn request_finish(&self) {}
        fn is_finished(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_default_wait_until_stopped_polls() {
        let lm = SlowStop {
            polls: AtomicUsize::new(0),
        };
        lm.wait_until_stopped(Duration::from_micros(10));
        assert_eq!(lm.polls.load(Ordering::SeqCst), 5);
    }
}
