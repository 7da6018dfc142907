//! Reference tracker: replays known camera poses.
//!
//! Feature extraction and pose estimation are outside this crate, so the
//! tracker takes the camera pose for each frame from a [`PoseTrack`]
//! (typically a dataset's ground truth). Everything downstream of the pose is
//! real: keyframe decisions, insertion into the shared `Map`, the
//! Tracking -> Local Mapping channel, the per-frame history and the tracked
//! observations reported back to the orchestrator.

use std::sync::Arc;

use crossbeam_channel::Sender;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::atlas::{SharedKeyFrameDb, SharedMap};
use crate::geometry::SE3;
use crate::system::collaborators::{LocalMapping, LoopClosing};
use crate::system::messages::NewKeyFrameMsg;
use crate::system::session::SessionContext;
use crate::tracking::engine::{
    KeyPoint, Sensor, SensorInput, TrackedObservations, TrackingEngine,
};
use crate::tracking::history::{FrameHistory, FrameRecord};
use crate::tracking::keyframe_decision::{KeyFrameCriteria, KeyFrameDecision};
use crate::tracking::matching::{match_descriptors, TH_HIGH};
use crate::tracking::pose_track::PoseTrack;
use crate::tracking::TrackingState;
use crate::vocabulary::Descriptor;

/// Bytes per descriptor, one pixel each.
const DESCRIPTOR_LEN: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub keyframes: KeyFrameCriteria,
    /// Max gap in seconds between a frame and the nearest replayed pose.
    pub pose_tolerance: f64,
    /// Features sampled per image.
    pub max_features: usize,
    /// Camera displacement in metres needed to initialize a monocular map.
    pub monocular_baseline: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            keyframes: KeyFrameCriteria::default(),
            pose_tolerance: 0.005,
            max_features: 64,
            monocular_baseline: 0.05,
        }
    }
}

/// First monocular frame, waiting for enough baseline.
struct InitCandidate {
    frame_id: u64,
    timestamp: f64,
    pose: SE3,
    descriptors: Vec<Descriptor>,
}

/// Tracking engine driven by a [`PoseTrack`].
pub struct Tracker {
    sensor: Sensor,
    config: ReplayConfig,
    poses: Arc<PoseTrack>,

    map: SharedMap,
    keyframe_db: SharedKeyFrameDb,

    /// Checked before inserting keyframes; a stopped mapper takes none.
    local_mapping: Arc<dyn LocalMapping>,

    /// Reset together with Local Mapping when the map is cleared.
    loop_closing: Arc<dyn LoopClosing>,

    /// Channel to send keyframes to Local Mapping.
    kf_sender: Sender<NewKeyFrameMsg>,

    kf_decision: KeyFrameDecision,

    pub state: TrackingState,
    only_tracking: bool,

    /// Running frame counter.
    next_frame_id: u64,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,

    init_candidate: Option<InitCandidate>,

    current_pose: Option<SE3>,
    observations: TrackedObservations,
    history: FrameHistory,
}

impl Tracker {
    pub fn new(
        ctx: &SessionContext,
        config: ReplayConfig,
        poses: Arc<PoseTrack>,
        local_mapping: Arc<dyn LocalMapping>,
        loop_closing: Arc<dyn LoopClosing>,
        kf_sender: Sender<NewKeyFrameMsg>,
    ) -> Self {
        Self {
            sensor: ctx.sensor,
            kf_decision: KeyFrameDecision::new(config.keyframes),
            config,
            poses,
            map: ctx.map.clone(),
            keyframe_db: ctx.keyframe_db.clone(),
            local_mapping,
            loop_closing,
            kf_sender,
            state: TrackingState::NoImagesYet,
            only_tracking: false,
            next_frame_id: ctx.next_frame_id,
            reference_kf: None,
            init_candidate: None,
            current_pose: None,
            observations: TrackedObservations::default(),
            history: FrameHistory::new(),
        }
    }

    fn accepts_keyframes(&self) -> bool {
        !self.local_mapping.is_stopped()
    }

    /// Closest live keyframe to the camera. Used to relocalize and, in
    /// localization mode, as the reference for every frame.
    fn nearest_keyframe(&self, t_wc: &SE3) -> Option<KeyFrameId> {
        let map = self.map.read();
        map.keyframes()
            .filter(|kf| !kf.is_bad)
            .min_by(|a, b| {
                let da = (a.camera_center() - t_wc.translation).norm();
                let db = (b.camera_center() - t_wc.translation).norm();
                da.total_cmp(&db)
            })
            .map(|kf| kf.id)
    }

    /// Match the frame against the reference keyframe. Returns the MapPoint
    /// seen by each feature and the number of MapPoints the reference holds.
    fn observe(&self, ref_id: KeyFrameId, descriptors: &[Descriptor]) -> (Vec<Option<MapPointId>>, usize) {
        let mut observed = vec![None; descriptors.len()];
        let map = self.map.read();
        let Some(kf) = map.get_keyframe(ref_id) else {
            return (observed, 0);
        };
        for (qi, ti) in match_descriptors(descriptors, &kf.descriptors, TH_HIGH) {
            observed[qi] = kf.get_map_point(ti);
        }
        (observed, kf.num_map_points())
    }

    /// Full SLAM path: pick the reference keyframe, inserting a new one when
    /// the decision criteria fire.
    fn map_frame(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        t_wc: &SE3,
        descriptors: &[Descriptor],
    ) -> Option<(KeyFrameId, Vec<Option<MapPointId>>)> {
        let live_reference = self
            .reference_kf
            .filter(|id| self.map.read().get_keyframe(*id).is_some_and(|kf| !kf.is_bad));
        let Some(ref_id) = live_reference.or_else(|| self.nearest_keyframe(t_wc)) else {
            let kf_id = self.initialize(frame_id, timestamp, t_wc, descriptors)?;
            return Some((kf_id, vec![None; descriptors.len()]));
        };

        let (observed, ref_points) = self.observe(ref_id, descriptors);
        if !self.accepts_keyframes() {
            return Some((ref_id, observed));
        }

        let distance = {
            let map = self.map.read();
            map.get_keyframe(ref_id)
                .map(|kf| (kf.camera_center() - t_wc.translation).norm())
                .unwrap_or(0.0)
        };
        let tracked = observed.iter().filter(|mp| mp.is_some()).count();
        if self
            .kf_decision
            .should_create_keyframe(distance, tracked, ref_points)
        {
            let kf_id =
                self.insert_keyframe(frame_id, timestamp, *t_wc, descriptors.to_vec(), Some(ref_id));
            return Some((kf_id, observed));
        }
        Some((ref_id, observed))
    }

    /// Create the first keyframe(s) of an empty map.
    ///
    /// Monocular maps need two views with enough baseline; the first frame
    /// is held as a candidate until then.
    fn initialize(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        t_wc: &SE3,
        descriptors: &[Descriptor],
    ) -> Option<KeyFrameId> {
        if !self.accepts_keyframes() {
            return None;
        }

        if self.sensor == Sensor::Monocular {
            let Some(candidate) = self.init_candidate.take() else {
                self.init_candidate = Some(InitCandidate {
                    frame_id,
                    timestamp,
                    pose: *t_wc,
                    descriptors: descriptors.to_vec(),
                });
                return None;
            };
            let baseline = (t_wc.translation - candidate.pose.translation).norm();
            if baseline < self.config.monocular_baseline {
                self.init_candidate = Some(candidate);
                return None;
            }
            let root = self.insert_keyframe(
                candidate.frame_id,
                candidate.timestamp,
                candidate.pose,
                candidate.descriptors,
                None,
            );
            let kf_id =
                self.insert_keyframe(frame_id, timestamp, *t_wc, descriptors.to_vec(), Some(root));
            info!(baseline, "New monocular map created");
            return Some(kf_id);
        }

        let kf_id = self.insert_keyframe(frame_id, timestamp, *t_wc, descriptors.to_vec(), None);
        info!("New map created");
        Some(kf_id)
    }

    fn insert_keyframe(
        &mut self,
        frame_id: u64,
        timestamp: f64,
        pose: SE3,
        descriptors: Vec<Descriptor>,
        parent: Option<KeyFrameId>,
    ) -> KeyFrameId {
        let keyframe_id = self
            .map
            .write()
            .create_keyframe(frame_id, timestamp, pose, descriptors, parent);
        self.kf_decision.reset();

        let msg = NewKeyFrameMsg {
            keyframe_id,
            frame_id,
            timestamp,
        };
        if self.kf_sender.send(msg).is_err() {
            warn!(%keyframe_id, "Local Mapping disconnected, keyframe not processed");
        }
        debug!(%keyframe_id, frame_id, "New keyframe");
        keyframe_id
    }

    fn mark_untracked(&mut self, timestamp: f64, keypoints: Vec<KeyPoint>) {
        self.current_pose = None;
        self.observations = TrackedObservations {
            map_points: vec![None; keypoints.len()],
            keypoints_un: keypoints,
        };
        self.state = match self.state {
            TrackingState::Ok => TrackingState::RecentlyLost,
            TrackingState::RecentlyLost | TrackingState::Lost => TrackingState::Lost,
            _ => TrackingState::NotInitialized,
        };
        if self.state.is_lost() {
            self.history.push_lost(timestamp);
        }
    }
}

impl TrackingEngine for Tracker {
    fn grab_frame(&mut self, input: &SensorInput<'_>, timestamp: f64) -> Option<SE3> {
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let (keypoints, descriptors) =
            extract_features(input.primary_image(), self.config.max_features);
        let pose = self.poses.pose_at(timestamp, self.config.pose_tolerance);

        let tracked = match pose {
            None => None,
            Some(t_wc) if self.only_tracking => self.nearest_keyframe(&t_wc).map(|ref_id| {
                let (observed, _) = self.observe(ref_id, &descriptors);
                (t_wc, ref_id, observed)
            }),
            Some(t_wc) => self
                .map_frame(frame_id, timestamp, &t_wc, &descriptors)
                .map(|(ref_id, observed)| (t_wc, ref_id, observed)),
        };

        let reference_pose = tracked.and_then(|(t_wc, ref_id, observed)| {
            let ref_pose = self.map.read().get_keyframe(ref_id).map(|kf| kf.pose)?;
            Some((t_wc, ref_id, ref_pose, observed))
        });
        let Some((t_wc, ref_id, ref_pose, observed)) = reference_pose else {
            self.mark_untracked(timestamp, keypoints);
            return None;
        };

        self.reference_kf = Some(ref_id);
        self.history.push(FrameRecord {
            relative_pose: ref_pose.inverse().compose(&t_wc),
            reference_kf: ref_id,
            timestamp,
            lost: false,
        });
        self.state = TrackingState::Ok;
        self.current_pose = Some(t_wc);
        self.observations = TrackedObservations {
            map_points: observed,
            keypoints_un: keypoints,
        };
        Some(t_wc)
    }

    fn state(&self) -> TrackingState {
        self.state
    }

    fn current_observations(&self) -> TrackedObservations {
        self.observations.clone()
    }

    fn current_camera_pose(&self) -> Option<SE3> {
        self.current_pose
    }

    fn history(&self) -> &FrameHistory {
        &self.history
    }

    fn inform_only_tracking(&mut self, only_tracking: bool) {
        self.only_tracking = only_tracking;
    }

    fn is_only_tracking(&self) -> bool {
        self.only_tracking
    }

    fn reset(&mut self) {
        info!("Resetting tracker");
        // Queued keyframe ids must be gone before the map restarts its ids.
        info!("Resetting Local Mapping...");
        self.local_mapping.reset();
        info!("Resetting Loop Closing...");
        self.loop_closing.reset();

        self.keyframe_db.write().clear();
        self.map.write().clear();
        self.history.clear();
        self.kf_decision.reset();
        self.state = TrackingState::NoImagesYet;
        self.next_frame_id = 0;
        self.reference_kf = None;
        self.init_candidate = None;
        self.current_pose = None;
        self.observations = TrackedObservations::default();
        info!("Reset done");
    }
}

/// Sample up to `max_features` keypoints on a vertical grid. Each descriptor
/// is the 32-pixel intensity strip starting at its keypoint's row offset.
pub fn extract_features(image: &GrayImage, max_features: usize) -> (Vec<KeyPoint>, Vec<Descriptor>) {
    let (width, height) = image.dimensions();
    if width < DESCRIPTOR_LEN || height == 0 || max_features == 0 {
        return (Vec::new(), Vec::new());
    }

    let rows = (max_features as u32).min(height);
    let span = width - DESCRIPTOR_LEN + 1;
    let mut keypoints = Vec::with_capacity(rows as usize);
    let mut descriptors = Vec::with_capacity(rows as usize);
    for i in 0..rows {
        let y = i * height / rows;
        let x0 = (i * 97) % span;
        let mut descriptor = [0u8; DESCRIPTOR_LEN as usize];
        for (k, byte) in descriptor.iter_mut().enumerate() {
            *byte = image.get_pixel(x0 + k as u32, y).0[0];
        }
        keypoints.push(KeyPoint {
            x: (x0 + DESCRIPTOR_LEN / 2) as f32,
            y: y as f32,
            octave: 0,
        });
        descriptors.push(descriptor);
    }
    (keypoints, descriptors)
}
