//! Wiring of the reference subsystem graph.
//!
//! Tracking -> Local Mapping -> Loop Closing, connected by bounded channels,
//! with each worker on its own named thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{info, warn};

use crate::atlas::map::KeyFrameId;
use crate::error::{Result, SystemError};
use crate::local_mapping::{LocalMapper, LocalMapperHandle};
use crate::loop_closing::{LoopCloser, LoopCloserConfig, LoopCloserHandle};
use crate::tracking::{PoseTrack, ReplayConfig, Tracker};

use super::collaborators::{LocalMapping, LoopClosing};
use super::messages::NewKeyFrameMsg;
use super::session::{SessionContext, SessionFactory, Subsystems};
use super::worker_control::WorkerControl;

/// Capacity of the keyframe channel between Tracking and Local Mapping.
/// When the channel is full, Tracking will block briefly.
const KEYFRAME_CHANNEL_CAPACITY: usize = 5;

/// Capacity of the keyframe channel between Local Mapping and Loop Closing.
/// When full, Local Mapping drops the keyframe for loop detection.
const LOOP_CHANNEL_CAPACITY: usize = 16;

/// Builds sessions around the pose-replay [`Tracker`].
pub struct ReplayFactory {
    config: ReplayConfig,
    loop_closer: LoopCloserConfig,
    poses: Arc<PoseTrack>,
}

impl ReplayFactory {
    pub fn new(config: ReplayConfig, poses: Arc<PoseTrack>) -> Self {
        Self {
            config,
            loop_closer: LoopCloserConfig::default(),
            poses,
        }
    }

    pub fn with_loop_closer(mut self, config: LoopCloserConfig) -> Self {
        self.loop_closer = config;
        self
    }
}

impl SessionFactory for ReplayFactory {
    fn build(&mut self, ctx: &SessionContext) -> Result<Subsystems> {
        let (kf_sender, kf_receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
        let (lc_sender, lc_receiver) = bounded::<KeyFrameId>(LOOP_CHANNEL_CAPACITY);

        let lm_control = Arc::new(WorkerControl::new());
        let mut local_mapper = LocalMapper::new(ctx, lm_control.clone(), Some(lc_sender));
        let lm_thread = spawn_worker("local-mapping", move || local_mapper.run(kf_receiver))?;
        let local_mapping: Arc<dyn LocalMapping> = Arc::new(LocalMapperHandle::new(lm_control.clone()));

        let lc_control = Arc::new(WorkerControl::new());
        let mut loop_closer = LoopCloser::new(ctx, lc_control.clone(), self.loop_closer.clone());
        let lc_thread = match spawn_worker("loop-closing", move || loop_closer.run(lc_receiver)) {
            Ok(handle) => handle,
            Err(e) => {
                lm_control.request_finish();
                if lm_thread.join().is_err() {
                    warn!("Local Mapping thread panicked while aborting session");
                }
                return Err(e);
            }
        };

        if ctx.use_viewer {
            warn!("Viewer requested but this build has no viewer, continuing without");
        }

        let loop_closing: Arc<dyn LoopClosing> = Arc::new(LoopCloserHandle::new(lc_control));
        let tracker = Tracker::new(
            ctx,
            self.config.clone(),
            self.poses.clone(),
            local_mapping.clone(),
            loop_closing.clone(),
            kf_sender,
        );

        info!(sensor = %ctx.sensor, reused_map = ctx.reused_map, "Subsystems started");
        Ok(Subsystems {
            tracker: Box::new(tracker),
            local_mapping,
            loop_closing,
            viewer: None,
            threads: vec![lm_thread, lc_thread],
        })
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| SystemError::SessionBuild(format!("cannot spawn {name} thread: {e}")))
}
