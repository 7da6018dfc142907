//! Cooperative shutdown of a session's workers.
//!
//! Order matters: the viewer is finished first so its rendering context can
//! be reclaimed, then Local Mapping and Loop Closing must both be finished
//! with no global bundle adjustment in flight, observed in the same poll.
//! The map is persisted only after that.

use std::time::Duration;

use tracing::{debug, info};

use super::collaborators::poll_until;
use super::session::MapSession;

/// Progress of [`crate::System::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ShutdownPhase {
    #[default]
    Running,
    StopRequested,
    WorkersFinished,
    Persisted,
    Done,
}

impl ShutdownPhase {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

/// Send a finish request to every worker of `session`.
pub fn request_finish(session: &MapSession) {
    session.local_mapping().request_finish();
    session.loop_closing().request_finish();
    if let Some(viewer) = session.viewer() {
        viewer.request_finish();
    }
    debug!(generation = session.generation(), "Finish requested");
}

/// Wait for the viewer to finish, then take its rendering context.
pub fn await_viewer(session: &MapSession, poll: Duration) {
    if let Some(viewer) = session.viewer() {
        poll_until(poll, || viewer.is_finished());
        viewer.bind_render_context();
        debug!("Viewer finished");
    }
}

/// Wait until Local Mapping and Loop Closing are finished and no global
/// bundle adjustment is running.
pub fn await_workers(session: &MapSession, poll: Duration) {
    let local_mapping = session.local_mapping();
    let loop_closing = session.loop_closing();
    poll_until(poll, || {
        local_mapping.is_finished() && loop_closing.is_finished() && !loop_closing.is_running_gba()
    });
    info!(generation = session.generation(), "All workers finished");
}
