//! Pending mode and reset requests.
//!
//! Callers on any thread set requests; the frame-processing path takes and
//! clears them once per frame before tracking.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::tracking::TrackingEngine;

use super::collaborators::LocalMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    /// Stop Local Mapping and track against the existing map only.
    ActivateLocalization,
    /// Resume full SLAM.
    DeactivateLocalization,
}

/// Mode request and reset flag, each behind its own lock.
#[derive(Debug, Default)]
pub struct SessionFlags {
    /// A newer request replaces an older one.
    mode: Mutex<Option<ModeRequest>>,
    reset: Mutex<bool>,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_mode(&self, request: ModeRequest) {
        *self.mode.lock() = Some(request);
    }

    pub fn request_reset(&self) {
        *self.reset.lock() = true;
    }

    pub fn take_mode(&self) -> Option<ModeRequest> {
        self.mode.lock().take()
    }

    pub fn take_reset(&self) -> bool {
        std::mem::take(&mut *self.reset.lock())
    }
}

/// Apply a mode request to the active session.
///
/// Activation blocks until Local Mapping reports stopped.
pub fn apply_mode_request(
    request: ModeRequest,
    tracker: &mut dyn TrackingEngine,
    local_mapping: &dyn LocalMapping,
    poll: Duration,
) {
    match request {
        ModeRequest::ActivateLocalization => {
            local_mapping.request_stop();
            local_mapping.wait_until_stopped(poll);
            tracker.inform_only_tracking(true);
            info!("Localization mode activated");
        }
        ModeRequest::DeactivateLocalization => {
            tracker.inform_only_tracking(false);
            local_mapping.release();
            info!("Localization mode deactivated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_mode_request_wins() {
        let flags = SessionFlags::new();
        assert_eq!(flags.take_mode(), None);

        flags.request_mode(ModeRequest::ActivateLocalization);
        flags.request_mode(ModeRequest::DeactivateLocalization);
        assert_eq!(flags.take_mode(), Some(ModeRequest::DeactivateLocalization));
        assert_eq!(flags.take_mode(), None);
    }

    #[test]
    fn test_reset_is_consumed_once() {
        let flags = SessionFlags::new();
        flags.request_reset();
        flags.request_reset();
        assert!(flags.take_reset());
        assert!(!flags.take_reset());
    }
}
