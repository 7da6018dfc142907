//! Tracking state machine.

/// State of the tracking front-end after the last processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No frame has been processed since construction or the last reset.
    #[default]
    NoImagesYet,
    /// Frames arrive but no map has been initialized from them yet.
    NotInitialized,
    /// Tracking successfully.
    Ok,
    /// Lost tracking on the last frame, attempting recovery.
    RecentlyLost,
    /// Lost for more than one frame, needs relocalization.
    Lost,
}

impl TrackingState {
    pub fn is_lost(self) -> bool {
        matches!(self, Self::RecentlyLost | Self::Lost)
    }
}
