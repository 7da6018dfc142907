//! System - Main entry point and map session orchestration.
//!
//! The `System` is the top-level struct that users interact with. It owns
//! the active [`MapSession`], gates every frame through the pending mode and
//! reset requests, swaps map segments in localization mode, and runs the
//! shutdown sequence.

use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::atlas::map::MapPointId;
use crate::atlas::SharedMap;
use crate::config::SystemConfig;
use crate::error::{Result, SystemError};
use crate::geometry::SE3;
use crate::io::{map_file, trajectory};
use crate::tracking::{DepthImage, KeyPoint, Sensor, SensorInput, TrackingState};
use crate::vocabulary::{OrbVocabulary, Vocabulary};

use super::mode::{apply_mode_request, ModeRequest, SessionFlags};
use super::session::{MapSession, MapSessionState, SegmentFiles, SegmentId, SessionContext, SessionFactory};
use super::shutdown::{self, ShutdownPhase};
use super::snapshot::{SnapshotStore, TrackingSnapshot};

/// Active session plus the state needed to replace it.
struct ActiveSession {
    session: MapSession,
    state: MapSessionState,
    factory: Box<dyn SessionFactory>,
    next_generation: u64,
}

/// Read-side view of the active map, updated on every swap.
#[derive(Clone)]
struct MapView {
    generation: u64,
    segment: SegmentId,
    map: SharedMap,
}

/// Main system orchestrating Tracking, Local Mapping and Loop Closing.
pub struct System {
    sensor: Sensor,
    config: SystemConfig,
    vocabulary: Arc<dyn Vocabulary>,

    flags: SessionFlags,
    snapshot: SnapshotStore,

    /// Held for the whole of a frame, a swap, or shutdown.
    active: Mutex<ActiveSession>,
    view: RwLock<MapView>,
    phase: Mutex<ShutdownPhase>,

    /// (generation, big change index) last reported by [`System::map_changed`].
    last_big_change: Mutex<(u64, u64)>,
}

impl System {
    /// Create the system and start the first session.
    ///
    /// With a map base name configured, segment 1 is loaded if its file
    /// exists; otherwise the session starts from an empty map.
    pub fn new(
        config: SystemConfig,
        sensor: Sensor,
        vocabulary: Arc<dyn Vocabulary>,
        mut factory: Box<dyn SessionFactory>,
    ) -> Result<Self> {
        info!(%sensor, "Input sensor");

        let segment = SegmentId::FIRST;
        let mut ctx = SessionContext::fresh(sensor, vocabulary.clone(), config.viewer.enabled);
        let mut extent = 0.0;
        if let Some(base) = config.map.file.as_deref() {
            let files = SegmentFiles::new(&config.map.output_dir, base, segment);
            info!(map = %files.map.display(), "Map name");
            if let Some(loaded) = map_file::load(&files.map, &vocabulary)? {
                extent = loaded.recorded_extent;
                ctx.map = Arc::new(RwLock::new(loaded.map));
                ctx.keyframe_db = Arc::new(RwLock::new(loaded.keyframe_db));
                ctx.next_frame_id = loaded.next_frame_id;
                ctx.reused_map = true;
            }
        }

        let session = MapSession::start(factory.as_mut(), &ctx, 0)?;
        let view = MapView {
            generation: 0,
            segment,
            map: ctx.map.clone(),
        };

        Ok(Self {
            sensor,
            config,
            vocabulary,
            flags: SessionFlags::new(),
            snapshot: SnapshotStore::new(),
            active: Mutex::new(ActiveSession {
                session,
                state: MapSessionState::new(segment, extent),
                factory,
                next_generation: 1,
            }),
            view: RwLock::new(view),
            phase: Mutex::new(ShutdownPhase::Running),
            last_big_change: Mutex::new((0, 0)),
        })
    }

    /// Load settings and vocabulary from disk, then start the system.
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(
        vocabulary_path: P,
        settings_path: Q,
        sensor: Sensor,
        factory: Box<dyn SessionFactory>,
    ) -> Result<Self> {
        let config = SystemConfig::from_yaml_file(settings_path)?;
        info!("Loading ORB Vocabulary. This could take a while...");
        let vocabulary = OrbVocabulary::load(vocabulary_path)?;
        info!("Vocabulary loaded");
        Self::new(config, sensor, Arc::new(vocabulary), factory)
    }

    pub fn sensor(&self) -> Sensor {
        self.sensor
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Process a rectified stereo pair. Returns the camera pose (T_wc), or
    /// `None` if tracking failed.
    pub fn track_stereo(&self, left: &GrayImage, right: &GrayImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Stereo { left, right }, timestamp)
    }

    /// Process an image with its registered depth map.
    pub fn track_rgbd(&self, image: &GrayImage, depth: &DepthImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Rgbd { image, depth }, timestamp)
    }

    pub fn track_monocular(&self, image: &GrayImage, timestamp: f64) -> Result<Option<SE3>> {
        self.track(SensorInput::Monocular { image }, timestamp)
    }

    fn track(&self, input: SensorInput<'_>, timestamp: f64) -> Result<Option<SE3>> {
        if input.sensor() != self.sensor {
            return Err(SystemError::ProtocolViolation(format!(
                "{} frame given to a {} system",
                input.sensor(),
                self.sensor
            )));
        }

        let mut active = self.active.lock();
        if !self.phase.lock().is_running() {
            return Err(SystemError::ProtocolViolation(
                "frame submitted after shutdown".to_string(),
            ));
        }

        if let Some(request) = self.flags.take_mode() {
            let local_mapping = active.session.local_mapping().clone();
            apply_mode_request(
                request,
                active.session.tracker_mut(),
                local_mapping.as_ref(),
                self.config.timing.stop_poll(),
            );
            self.snapshot
                .set_only_tracking(active.session.tracker().is_only_tracking());
        }
        if self.flags.take_reset() {
            self.handle_reset(&mut active)?;
        }

        let pose = active.session.tracker_mut().grab_frame(&input, timestamp);
        self.snapshot
            .publish(TrackingSnapshot::capture(active.session.tracker()));

        if self.multi_map_active(&active) {
            self.check_map_extent(&mut active)?;
        }
        Ok(pose)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mode and reset requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop Local Mapping and track against the existing map only. Applied
    /// before the next frame.
    pub fn activate_localization_mode(&self) {
        self.flags.request_mode(ModeRequest::ActivateLocalization);
    }

    /// Resume full SLAM. Applied before the next frame.
    pub fn deactivate_localization_mode(&self) {
        self.flags.request_mode(ModeRequest::DeactivateLocalization);
    }

    /// Reset the system before the next frame.
    pub fn reset(&self) {
        self.flags.request_reset();
    }

    fn handle_reset(&self, active: &mut ActiveSession) -> Result<()> {
        let only_tracking = active.session.tracker().is_only_tracking();
        if self.sensor == Sensor::Monocular && !only_tracking && self.persist_segment(active)? {
            active.state.advance();
            self.view.write().segment = active.state.segment();
            info!(segment = %active.state.segment(), "Reset map");
        }
        active.session.tracker_mut().reset();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Multi-map
    // ─────────────────────────────────────────────────────────────────────────

    fn multi_map_active(&self, active: &ActiveSession) -> bool {
        self.sensor == Sensor::Monocular
            && self.config.map.file.is_some()
            && active.session.tracker().is_only_tracking()
    }

    /// Swap in the next map segment once the camera is farther from the
    /// origin than the loaded map reaches. A segment that cannot be loaded is
    /// retried on the next frame.
    fn check_map_extent(&self, active: &mut ActiveSession) -> Result<()> {
        let Some(pose) = self.snapshot.camera_pose() else {
            return Ok(());
        };
        let traveled = active
            .state
            .record_position(&pose.translation, self.config.multi_map.distance_bias);
        if !active.state.exceeds_extent() {
            return Ok(());
        }
        let Some(base) = self.config.map.file.as_deref() else {
            return Ok(());
        };

        let candidate = active.state.segment().next();
        let files = SegmentFiles::new(&self.config.map.output_dir, base, candidate);
        let Some(loaded) = map_file::load(&files.map, &self.vocabulary)? else {
            debug!(%candidate, traveled, "Next map segment not available");
            return Ok(());
        };

        let ctx = SessionContext {
            sensor: self.sensor,
            map: Arc::new(RwLock::new(loaded.map)),
            keyframe_db: Arc::new(RwLock::new(loaded.keyframe_db)),
            vocabulary: self.vocabulary.clone(),
            reused_map: true,
            next_frame_id: loaded.next_frame_id,
            use_viewer: self.config.viewer.enabled,
        };
        let generation = active.next_generation;
        let next = match MapSession::start(active.factory.as_mut(), &ctx, generation) {
            Ok(session) => session,
            Err(e) => {
                warn!(%candidate, error = %e, "Cannot start session for next map segment");
                return Ok(());
            }
        };
        active.next_generation += 1;

        active.session.finish_and_join(self.config.timing.finish_poll());
        active.session = next;

        let local_mapping = active.session.local_mapping().clone();
        local_mapping.request_stop();
        local_mapping.wait_until_stopped(self.config.timing.stop_poll());
        active.session.tracker_mut().inform_only_tracking(true);
        self.snapshot.set_only_tracking(true);
        active.state.enter_segment(candidate, loaded.recorded_extent);

        *self.view.write() = MapView {
            generation,
            segment: candidate,
            map: ctx.map.clone(),
        };
        info!(
            segment = %candidate,
            traveled,
            extent = loaded.recorded_extent,
            "Switched to next map segment"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn tracking_state(&self) -> TrackingState {
        self.snapshot.state()
    }

    pub fn tracked_map_points(&self) -> Vec<Option<MapPointId>> {
        self.snapshot.tracked_map_points()
    }

    pub fn tracked_keypoints_un(&self) -> Vec<KeyPoint> {
        self.snapshot.tracked_keypoints_un()
    }

    /// Camera centre of the last tracked frame.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.snapshot.camera_pose().map(|pose| pose.translation)
    }

    /// Camera-to-world rotation of the last tracked frame.
    pub fn camera_rotation(&self) -> Option<UnitQuaternion<f64>> {
        self.snapshot.camera_pose().map(|pose| pose.rotation)
    }

    pub fn is_only_tracking(&self) -> bool {
        self.snapshot.only_tracking()
    }

    /// Segment whose files the current map is saved under.
    pub fn segment_index(&self) -> SegmentId {
        self.view.read().segment
    }

    /// True once per big change (loop closure, global BA) of the active map.
    pub fn map_changed(&self) -> bool {
        let view = self.view.read().clone();
        let idx = view.map.read().last_big_change_idx();
        let mut last = self.last_big_change.lock();
        if last.0 != view.generation {
            *last = (view.generation, 0);
        }
        if idx > last.1 {
            last.1 = idx;
            true
        } else {
            // A reset clears the counter.
            last.1 = idx;
            false
        }
    }

    /// Camera centres of the active map's live keyframes, by id.
    pub fn loaded_map_keyframe_centers(&self) -> Vec<Vector3<f64>> {
        let map = self.view.read().map.clone();
        let map = map.read();
        map.keyframes_sorted()
            .into_iter()
            .filter(|kf| !kf.is_bad)
            .map(|kf| kf.camera_center())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trajectory export
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-frame trajectory in TUM format. Lost frames are skipped. Not
    /// available for monocular input.
    pub fn save_trajectory_tum<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.refuse_monocular("TUM")?;
        let active = self.active.lock();
        let map = active.session.map().read();
        trajectory::save_tum(path.as_ref(), &map, active.session.tracker().history())
    }

    /// Per-frame trajectory in KITTI format. Lost frames are written with
    /// their last known relative pose. Not available for monocular input.
    pub fn save_trajectory_kitti<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.refuse_monocular("KITTI")?;
        let active = self.active.lock();
        let map = active.session.map().read();
        trajectory::save_kitti(path.as_ref(), &map, active.session.tracker().history())
    }

    /// Keyframe trajectory in TUM format, plus the keyframe camera centres in
    /// a YAML file next to it.
    pub fn save_keyframe_trajectory_tum<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let active = self.active.lock();
        let map = active.session.map().read();
        trajectory::save_keyframe_trajectory(path, &path.with_extension("yaml"), &map)
    }

    fn refuse_monocular(&self, format: &str) -> Result<()> {
        if self.sensor == Sensor::Monocular {
            return Err(SystemError::ProtocolViolation(format!(
                "{format} trajectory cannot be saved for monocular input"
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence and shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Save the active map and its keyframe trajectory under the current
    /// segment's names. Returns false when persistence is off or the map is
    /// empty.
    fn persist_segment(&self, active: &ActiveSession) -> Result<bool> {
        let Some(base) = self.config.map.file.as_deref() else {
            return Ok(false);
        };
        if !self.config.map.save {
            return Ok(false);
        }
        let map = active.session.map().read();
        if map.is_empty() {
            debug!("Map is empty, nothing to save");
            return Ok(false);
        }

        let files = SegmentFiles::new(&self.config.map.output_dir, base, active.state.segment());
        map_file::save(&files.map, &map, &active.session.keyframe_db().read())?;
        if let Err(e) =
            trajectory::save_keyframe_trajectory(&files.keyframe_trajectory, &files.keyframe_yaml, &map)
        {
            warn!(error = %e, "Keyframe trajectory not saved");
        }
        Ok(true)
    }

    pub fn shutdown_phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Finish all workers, wait for them, and persist the map.
    ///
    /// Blocks until every worker has finished. Only the first call does
    /// anything; later calls return `Ok(())`.
    pub fn shutdown(&self) -> Result<()> {
        let mut active = self.active.lock();
        {
            let mut phase = self.phase.lock();
            if !phase.is_running() {
                return Ok(());
            }
            *phase = ShutdownPhase::StopRequested;
        }
        info!("Shutdown requested");

        let poll = self.config.timing.finish_poll();
        shutdown::request_finish(&active.session);
        shutdown::await_viewer(&active.session, poll);
        shutdown::await_workers(&active.session, poll);
        active.session.join_threads();
        *self.phase.lock() = ShutdownPhase::WorkersFinished;

        let persisted = if active.session.tracker().is_only_tracking() {
            Ok(false)
        } else {
            self.persist_segment(&active)
        };
        let result = persisted.map(|saved| {
            *self.phase.lock() = ShutdownPhase::Persisted;
            if saved {
                info!(segment = %active.state.segment(), "Map persisted");
            }
        });
        *self.phase.lock() = ShutdownPhase::Done;
        info!("Shutdown complete");
        result
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if self.phase.get_mut().is_running() {
            if let Err(e) = self.shutdown() {
                error!(error = %e, "Shutdown on drop failed");
            }
        }
    }
}
