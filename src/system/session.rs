//! Map sessions and map segment bookkeeping.
//!
//! A [`MapSession`] is one active Map + KeyFrame Database together with the
//! Tracking engine and the workers bound to it. Exactly one session is active
//! at a time. Replacing it goes through [`MapSession::finish_and_join`] so the
//! previous workers never touch shared state after the handoff.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::Vector3;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::atlas::{KeyFrameDatabase, Map, SharedKeyFrameDb, SharedMap};
use crate::error::Result;
use crate::tracking::{Sensor, TrackingEngine};
use crate::vocabulary::Vocabulary;

use super::collaborators::{LocalMapping, LoopClosing, Viewer};
use super::shutdown;

/// Index of a persisted map segment, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u32);

impl SegmentId {
    pub const FIRST: SegmentId = SegmentId(1);

    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// `<i><base>`
    pub fn map_file_name(self, base: &str) -> String {
        format!("{}{}", self.0, base)
    }

    pub fn keyframe_trajectory_file_name(self) -> String {
        format!("{}KeyFrameTrajectory.txt", self.0)
    }

    pub fn keyframe_trajectory_yaml_name(self) -> String {
        format!("{}KeyFrameTrajectory.yaml", self.0)
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {}", self.0)
    }
}

/// Files belonging to one map segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFiles {
    pub map: PathBuf,
    pub keyframe_trajectory: PathBuf,
    pub keyframe_yaml: PathBuf,
}

impl SegmentFiles {
    pub fn new(dir: &Path, base: &str, segment: SegmentId) -> Self {
        Self {
            map: dir.join(segment.map_file_name(base)),
            keyframe_trajectory: dir.join(segment.keyframe_trajectory_file_name()),
            keyframe_yaml: dir.join(segment.keyframe_trajectory_yaml_name()),
        }
    }
}

/// Per-orchestrator multi-map counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MapSessionState {
    segment: SegmentId,
    /// Extent of the loaded map, 0.0 for a fresh one.
    recorded_extent: f64,
    traveled_distance: f64,
}

impl MapSessionState {
    pub fn new(segment: SegmentId, recorded_extent: f64) -> Self {
        Self {
            segment,
            recorded_extent,
            traveled_distance: 0.0,
        }
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    pub fn recorded_extent(&self) -> f64 {
        self.recorded_extent
    }

    pub fn traveled_distance(&self) -> f64 {
        self.traveled_distance
    }

    /// Update the traveled distance from the current camera centre.
    pub fn record_position(&mut self, camera_center: &Vector3<f64>, bias: f64) -> f64 {
        self.traveled_distance = camera_center.norm() + bias;
        self.traveled_distance
    }

    /// The camera left the area covered by the loaded map.
    pub fn exceeds_extent(&self) -> bool {
        self.traveled_distance > self.recorded_extent
    }

    /// Commit a move to `segment` whose map covers `recorded_extent`.
    pub fn enter_segment(&mut self, segment: SegmentId, recorded_extent: f64) {
        self.segment = segment;
        self.recorded_extent = recorded_extent;
        self.traveled_distance = 0.0;
    }

    /// Advance past a finalized segment.
    pub fn advance(&mut self) {
        self.segment = self.segment.next();
    }
}

/// Everything a [`SessionFactory`] needs to build the subsystems of a session.
#[derive(Clone)]
pub struct SessionContext {
    pub sensor: Sensor,
    pub map: SharedMap,
    pub keyframe_db: SharedKeyFrameDb,
    pub vocabulary: Arc<dyn Vocabulary>,
    /// The map was loaded from disk rather than created empty.
    pub reused_map: bool,
    /// First frame id the tracker may hand out.
    pub next_frame_id: u64,
    pub use_viewer: bool,
}

impl SessionContext {
    /// Context for an empty map.
    pub fn fresh(sensor: Sensor, vocabulary: Arc<dyn Vocabulary>, use_viewer: bool) -> Self {
        Self {
            sensor,
            map: Arc::new(RwLock::new(Map::new())),
            keyframe_db: Arc::new(RwLock::new(KeyFrameDatabase::new(vocabulary.clone()))),
            vocabulary,
            reused_map: false,
            next_frame_id: 0,
            use_viewer,
        }
    }
}

/// Tracking engine and workers of one session, already started.
pub struct Subsystems {
    pub tracker: Box<dyn TrackingEngine>,
    pub local_mapping: Arc<dyn LocalMapping>,
    pub loop_closing: Arc<dyn LoopClosing>,
    pub viewer: Option<Arc<dyn Viewer>>,
    /// Worker threads owned by the session, joined when it ends.
    pub threads: Vec<JoinHandle<()>>,
}

/// Builds and wires the subsystem graph of a session.
pub trait SessionFactory: Send {
    fn build(&mut self, ctx: &SessionContext) -> Result<Subsystems>;
}

/// The active Map, KeyFrame Database and subsystems.
pub struct MapSession {
    generation: u64,
    map: SharedMap,
    keyframe_db: SharedKeyFrameDb,
    subsystems: Subsystems,
}

impl MapSession {
    /// Build a session from `ctx` using `factory`.
    pub fn start(
        factory: &mut dyn SessionFactory,
        ctx: &SessionContext,
        generation: u64,
    ) -> Result<Self> {
        let subsystems = factory.build(ctx)?;
        debug!(
            generation,
            reused_map = ctx.reused_map,
            workers = subsystems.threads.len(),
            "Map session started"
        );
        Ok(Self {
            generation,
            map: ctx.map.clone(),
            keyframe_db: ctx.keyframe_db.clone(),
            subsystems,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn map(&self) -> &SharedMap {
        &self.map
    }

    pub fn keyframe_db(&self) -> &SharedKeyFrameDb {
        &self.keyframe_db
    }

    pub fn tracker(&self) -> &dyn TrackingEngine {
        self.subsystems.tracker.as_ref()
    }

    pub fn tracker_mut(&mut self) -> &mut dyn TrackingEngine {
        self.subsystems.tracker.as_mut()
    }

    pub fn local_mapping(&self) -> &Arc<dyn LocalMapping> {
        &self.subsystems.local_mapping
    }

    pub fn loop_closing(&self) -> &Arc<dyn LoopClosing> {
        &self.subsystems.loop_closing
    }

    pub fn viewer(&self) -> Option<&Arc<dyn Viewer>> {
        self.subsystems.viewer.as_ref()
    }

    /// Finish every worker of a superseded session and join its threads.
    ///
    /// Unbounded, like every other wait on the workers.
    pub fn finish_and_join(&mut self, poll: Duration) {
        shutdown::request_finish(self);
        shutdown::await_viewer(self, poll);
        shutdown::await_workers(self, poll);
        self.join_threads();
        info!(generation = self.generation, "Map session retired");
    }

    /// Join the worker threads. Safe to call more than once.
    pub fn join_threads(&mut self) {
        for handle in self.subsystems.threads.drain(..) {
            if handle.join().is_err() {
                error!(generation = self.generation, "Worker thread panicked");
            }
        }
    }
}
