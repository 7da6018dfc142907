//! Orchestrator behavior against mock tracking and worker implementations.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::GrayImage;
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;

use vslam_orchestrator::atlas::{KeyFrameDatabase, Map, SharedMap};
use vslam_orchestrator::geometry::SE3;
use vslam_orchestrator::io::map_file;
use vslam_orchestrator::system::collaborators::poll_until;
use vslam_orchestrator::system::{
    LocalMapping, LoopClosing, SegmentId, SessionContext, SessionFactory, ShutdownPhase, Subsystems,
    Viewer,
};
use vslam_orchestrator::tracking::{
    FrameHistory, FrameRecord, SensorInput, TrackedObservations, TrackingEngine, TrackingState,
};
use vslam_orchestrator::vocabulary::{BowVector, Descriptor, Vocabulary};
use vslam_orchestrator::{ErrorKind, Sensor, System, SystemConfig, SystemError};

// ─────────────────────────────────────────────────────────────────────────────
// Mocks
// ─────────────────────────────────────────────────────────────────────────────

struct NullVocabulary;

impl Vocabulary for NullVocabulary {
    fn transform(&self, _descriptors: &[Descriptor]) -> BowVector {
        BowVector::new()
    }

    fn num_words(&self) -> usize {
        0
    }
}

/// Shared view into everything the mocks were asked to do.
#[derive(Default)]
struct Recorder {
    /// (reused_map, next_frame_id) of every session built.
    builds: Mutex<Vec<(bool, u64)>>,
    maps: Mutex<Vec<SharedMap>>,
    local_mappers: Mutex<Vec<Arc<MockLocalMapping>>>,
    viewers: Mutex<Vec<Arc<MockViewer>>>,
    /// Viewer polls, render context binds and GBA polls, in call order.
    events: Mutex<Vec<&'static str>>,
    /// Camera position returned for the next frames.
    position: Mutex<Vector3<f64>>,
    resets: AtomicUsize,
    gba_busy_polls: AtomicUsize,
    gba_calls: AtomicUsize,
}

#[derive(Default)]
struct MockLocalMapping {
    stopped: AtomicBool,
    /// Keeps a requested stop from completing.
    hold_stop: AtomicBool,
    finished: AtomicBool,
}

impl LocalMapping for MockLocalMapping {
    fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) && !self.hold_stop.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn request_finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

struct MockLoopClosing {
    recorder: Arc<Recorder>,
    finished: AtomicBool,
}

impl LoopClosing for MockLoopClosing {
    fn request_finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn is_running_gba(&self) -> bool {
        self.recorder.events.lock().push("gba");
        self.recorder.gba_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .gba_busy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Reports finished once it has been polled `busy_polls` times after the
/// finish request.
struct MockViewer {
    recorder: Arc<Recorder>,
    finish_requested: AtomicBool,
    busy_polls: AtomicUsize,
    binds: AtomicUsize,
}

impl Viewer for MockViewer {
    fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.recorder.events.lock().push("viewer_poll");
        self.finish_requested.load(Ordering::SeqCst)
            && self
                .busy_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
    }

    fn bind_render_context(&self) {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.recorder.events.lock().push("bind");
    }
}

/// Places the camera wherever the recorder says and adds a keyframe per frame
/// while mapping.
struct MockTracker {
    recorder: Arc<Recorder>,
    map: SharedMap,
    next_frame_id: u64,
    only_tracking: bool,
    pose: Option<SE3>,
    history: FrameHistory,
}

impl TrackingEngine for MockTracker {
    fn grab_frame(&mut self, _input: &SensorInput<'_>, timestamp: f64) -> Option<SE3> {
        let pose = SE3::from_rt(UnitQuaternion::identity(), *self.recorder.position.lock());
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        if !self.only_tracking {
            let mut map = self.map.write();
            let parent = map.last_keyframe().map(|kf| kf.id);
            let kf_id = map.create_keyframe(frame_id, timestamp, pose, vec![], parent);
            self.history.push(FrameRecord {
                relative_pose: SE3::identity(),
                reference_kf: kf_id,
                timestamp,
                lost: false,
            });
        }
        self.pose = Some(pose);
        self.pose
    }

    fn state(&self) -> TrackingState {
        if self.pose.is_some() {
            TrackingState::Ok
        } else {
            TrackingState::NoImagesYet
        }
    }

    fn current_observations(&self) -> TrackedObservations {
        TrackedObservations::default()
    }

    fn current_camera_pose(&self) -> Option<SE3> {
        self.pose
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
        self.recorder.resets.fetch_add(1, Ordering::SeqCst);
        self.map.write().clear();
        self.history.clear();
        self.next_frame_id = 0;
        self.pose = None;
    }
}

struct MockFactory {
    recorder: Arc<Recorder>,
    /// Give every session a viewer that needs this many extra polls to finish.
    viewer_busy_polls: Option<usize>,
}

impl SessionFactory for MockFactory {
    fn build(&mut self, ctx: &SessionContext) -> vslam_orchestrator::Result<Subsystems> {
        self.recorder.builds.lock().push((ctx.reused_map, ctx.next_frame_id));
        self.recorder.maps.lock().push(ctx.map.clone());
        let local_mapping = Arc::new(MockLocalMapping::default());
        self.recorder.local_mappers.lock().push(local_mapping.clone());
        let viewer = self.viewer_busy_polls.map(|busy_polls| {
            let viewer = Arc::new(MockViewer {
                recorder: self.recorder.clone(),
                finish_requested: AtomicBool::new(false),
                busy_polls: AtomicUsize::new(busy_polls),
                binds: AtomicUsize::new(0),
            });
            self.recorder.viewers.lock().push(viewer.clone());
            viewer as Arc<dyn Viewer>
        });
        Ok(Subsystems {
            tracker: Box::new(MockTracker {
                recorder: self.recorder.clone(),
                map: ctx.map.clone(),
                next_frame_id: ctx.next_frame_id,
                only_tracking: false,
                pose: None,
                history: FrameHistory::new(),
            }),
            local_mapping,
            loop_closing: Arc::new(MockLoopClosing {
                recorder: self.recorder.clone(),
                finished: AtomicBool::new(false),
            }),
            viewer,
            threads: Vec::new(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn vocabulary() -> Arc<dyn Vocabulary> {
    Arc::new(NullVocabulary)
}

fn config(dir: Option<&Path>) -> SystemConfig {
    let mut config = SystemConfig::default();
    config.timing.stop_poll_us = 10;
    config.timing.finish_poll_us = 10;
    if let Some(dir) = dir {
        config.map.file = Some("Map.bin".to_string());
        config.map.output_dir = dir.to_path_buf();
    }
    config
}

fn start(sensor: Sensor, config: SystemConfig) -> (System, Arc<Recorder>) {
    start_with_viewer(sensor, config, None)
}

fn start_with_viewer(
    sensor: Sensor,
    config: SystemConfig,
    viewer_busy_polls: Option<usize>,
) -> (System, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let factory = MockFactory {
        recorder: recorder.clone(),
        viewer_busy_polls,
    };
    let system = System::new(config, sensor, vocabulary(), Box::new(factory)).unwrap();
    (system, recorder)
}

fn image() -> GrayImage {
    GrayImage::new(64, 8)
}

fn move_to(recorder: &Recorder, x: f64) {
    *recorder.position.lock() = Vector3::new(x, 0.0, 0.0);
}

/// Persist a segment whose newest keyframe sits `extent` metres from the origin.
fn write_segment(dir: &Path, segment: u32, extent: f64, last_frame_id: u64) {
    let mut map = Map::new();
    let root = map.create_keyframe(0, 0.0, SE3::identity(), vec![], None);
    let far = SE3::from_rt(UnitQuaternion::identity(), Vector3::new(extent, 0.0, 0.0));
    map.create_keyframe(last_frame_id, 1.0, far, vec![], Some(root));
    let path = dir.join(SegmentId::new(segment).map_file_name("Map.bin"));
    map_file::save(&path, &map, &KeyFrameDatabase::new(vocabulary())).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode and reset
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_tracking_only_follows_latest_applied_request() {
    let (system, recorder) = start(Sensor::Stereo, config(None));
    let img = image();

    // (activate?) requests issued before each frame
    let rounds: [&[bool]; 6] = [&[true], &[false], &[true, false], &[false, true], &[], &[true, true]];
    let mut expected = false;
    for (i, requests) in rounds.iter().enumerate() {
        for activate in requests.iter() {
            if *activate {
                system.activate_localization_mode();
            } else {
                system.deactivate_localization_mode();
            }
            expected = *activate;
        }
        system.track_stereo(&img, &img, i as f64).unwrap();
        assert_eq!(system.is_only_tracking(), expected, "round {i}");
        let lm = recorder.local_mappers.lock()[0].clone();
        assert_eq!(lm.is_stopped(), expected, "round {i}");
    }
}

#[test]
fn test_mode_is_readable_while_a_frame_waits_for_local_mapping() {
    let (system, recorder) = start(Sensor::Stereo, config(None));
    let lm = recorder.local_mappers.lock()[0].clone();
    lm.hold_stop.store(true, Ordering::SeqCst);
    system.activate_localization_mode();
    let img = image();

    thread::scope(|s| {
        let frame = s.spawn(|| system.track_stereo(&img, &img, 0.0));
        poll_until(Duration::from_micros(10), || lm.stopped.load(Ordering::SeqCst));

        // The frame holds the session until Local Mapping stops.
        assert!(!system.is_only_tracking());
        assert_eq!(system.tracking_state(), TrackingState::NoImagesYet);

        lm.hold_stop.store(false, Ordering::SeqCst);
        frame.join().unwrap().unwrap();
    });
    assert!(system.is_only_tracking());
}

#[test]
fn test_repeated_reset_requests_reset_once() {
    let (system, recorder) = start(Sensor::Rgbd, config(None));
    let img = image();
    let depth = vslam_orchestrator::tracking::DepthImage::new(64, 8);

    system.track_rgbd(&img, &depth, 0.0).unwrap();
    system.reset();
    system.reset();
    system.reset();
    system.track_rgbd(&img, &depth, 0.1).unwrap();
    assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);

    system.track_rgbd(&img, &depth, 0.2).unwrap();
    assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_monocular_reset_finalizes_segment() {
    let dir = tempfile::tempdir().unwrap();
    let (system, recorder) = start(Sensor::Monocular, config(Some(dir.path())));
    let img = image();

    move_to(&recorder, 1.0);
    system.track_monocular(&img, 0.0).unwrap();
    system.track_monocular(&img, 0.1).unwrap();
    system.reset();
    system.track_monocular(&img, 0.2).unwrap();

    assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);
    assert_eq!(system.segment_index(), SegmentId::new(2));
    assert!(dir.path().join("1Map.bin").exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("1KeyFrameTrajectory.txt"))
            .unwrap()
            .lines()
            .count(),
        2
    );
    let yaml = std::fs::read_to_string(dir.path().join("1KeyFrameTrajectory.yaml")).unwrap();
    assert!(yaml.contains("NumberOfKeyFrames: 2"));
}

#[test]
fn test_reset_without_persistence_keeps_segment() {
    let (system, recorder) = start(Sensor::Monocular, config(None));
    let img = image();
    system.track_monocular(&img, 0.0).unwrap();
    system.reset();
    system.track_monocular(&img, 0.1).unwrap();
    assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);
    assert_eq!(system.segment_index(), SegmentId::FIRST);
}

// ─────────────────────────────────────────────────────────────────────────────
// Multi-map
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_loaded_segment_is_reused_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), 1, 5.0, 41);
    let (system, recorder) = start(Sensor::Monocular, config(Some(dir.path())));

    assert_eq!(*recorder.builds.lock(), vec![(true, 42)]);
    assert_eq!(system.loaded_map_keyframe_centers().len(), 2);
    assert_eq!(system.segment_index(), SegmentId::FIRST);
}

#[test]
fn test_swap_fires_only_beyond_recorded_extent() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), 1, 5.0, 10);
    write_segment(dir.path(), 2, 7.5, 20);
    let (system, recorder) = start(Sensor::Monocular, config(Some(dir.path())));
    let img = image();
    system.activate_localization_mode();

    // 4.85 + 0.1 stays inside 5.0
    move_to(&recorder, 4.85);
    system.track_monocular(&img, 0.0).unwrap();
    assert_eq!(system.segment_index(), SegmentId::FIRST);
    assert_eq!(recorder.builds.lock().len(), 1);

    // 4.95 + 0.1 leaves it
    move_to(&recorder, 4.95);
    system.track_monocular(&img, 0.1).unwrap();
    assert_eq!(system.segment_index(), SegmentId::new(2));
    assert_eq!(*recorder.builds.lock(), vec![(true, 11), (true, 21)]);
    assert!(system.is_only_tracking());

    let mappers = recorder.local_mappers.lock().clone();
    assert!(mappers[0].is_finished());
    assert!(mappers[1].is_stopped());
    assert!(!mappers[1].is_finished());

    // The new segment's extent applies from here on.
    move_to(&recorder, 7.0);
    system.track_monocular(&img, 0.2).unwrap();
    assert_eq!(system.segment_index(), SegmentId::new(2));
}

#[test]
fn test_failed_load_does_not_consume_segment() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), 1, 5.0, 10);
    let (system, recorder) = start(Sensor::Monocular, config(Some(dir.path())));
    let img = image();
    system.activate_localization_mode();

    move_to(&recorder, 6.0);
    system.track_monocular(&img, 0.0).unwrap();
    system.track_monocular(&img, 0.1).unwrap();
    assert_eq!(system.segment_index(), SegmentId::FIRST);
    assert_eq!(recorder.builds.lock().len(), 1);

    // Retried on the very next frame once the file shows up.
    write_segment(dir.path(), 2, 9.0, 30);
    system.track_monocular(&img, 0.2).unwrap();
    assert_eq!(system.segment_index(), SegmentId::new(2));
}

#[test]
fn test_no_swap_while_mapping() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), 1, 5.0, 10);
    write_segment(dir.path(), 2, 7.5, 20);
    let (system, recorder) = start(Sensor::Monocular, config(Some(dir.path())));

    move_to(&recorder, 6.0);
    system.track_monocular(&image(), 0.0).unwrap();
    assert_eq!(system.segment_index(), SegmentId::FIRST);
    assert_eq!(recorder.builds.lock().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_shutdown_waits_for_global_ba() {
    let (system, recorder) = start(Sensor::Stereo, config(None));
    recorder.gba_busy_polls.store(3, Ordering::SeqCst);

    system.shutdown().unwrap();
    assert_eq!(recorder.gba_calls.load(Ordering::SeqCst), 4);
    assert_eq!(system.shutdown_phase(), ShutdownPhase::Done);
    assert!(recorder.local_mappers.lock()[0].is_finished());
}

#[test]
fn test_shutdown_binds_viewer_context_after_it_finishes() {
    let (system, recorder) = start_with_viewer(Sensor::Stereo, config(None), Some(3));
    let viewer = recorder.viewers.lock()[0].clone();

    system.shutdown().unwrap();
    assert!(viewer.finish_requested.load(Ordering::SeqCst));
    assert_eq!(viewer.binds.load(Ordering::SeqCst), 1);
    // Three busy polls, the finishing poll, the rebind, then the workers.
    assert_eq!(
        *recorder.events.lock(),
        vec!["viewer_poll", "viewer_poll", "viewer_poll", "viewer_poll", "bind", "gba"]
    );

    system.shutdown().unwrap();
    assert_eq!(viewer.binds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_segment_swap_retires_viewer() {
    let dir = tempfile::tempdir().unwrap();
    write_segment(dir.path(), 1, 5.0, 10);
    write_segment(dir.path(), 2, 7.5, 20);
    let (system, recorder) =
        start_with_viewer(Sensor::Monocular, config(Some(dir.path())), Some(2));
    let img = image();
    system.activate_localization_mode();

    move_to(&recorder, 6.0);
    system.track_monocular(&img, 0.0).unwrap();
    assert_eq!(system.segment_index(), SegmentId::new(2));

    let viewers = recorder.viewers.lock().clone();
    assert_eq!(viewers.len(), 2);
    assert!(viewers[0].finish_requested.load(Ordering::SeqCst));
    assert_eq!(viewers[0].binds.load(Ordering::SeqCst), 1);
    assert!(!viewers[1].finish_requested.load(Ordering::SeqCst));
    assert_eq!(viewers[1].binds.load(Ordering::SeqCst), 0);
    assert_eq!(
        *recorder.events.lock(),
        vec!["viewer_poll", "viewer_poll", "viewer_poll", "bind", "gba"]
    );

    system.shutdown().unwrap();
    assert_eq!(viewers[0].binds.load(Ordering::SeqCst), 1);
    assert_eq!(viewers[1].binds.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_persists_once() {
    let dir = tempfile::tempdir().unwrap();
    let (system, recorder) = start(Sensor::Stereo, config(Some(dir.path())));
    let img = image();
    move_to(&recorder, 1.0);
    system.track_stereo(&img, &img, 0.0).unwrap();

    system.shutdown().unwrap();
    let map_path = dir.path().join("1Map.bin");
    assert!(map_path.exists());
    assert!(dir.path().join("1KeyFrameTrajectory.yaml").exists());

    std::fs::remove_file(&map_path).unwrap();
    system.shutdown().unwrap();
    assert!(!map_path.exists());
}

#[test]
fn test_shutdown_skips_empty_and_tracking_only_maps() {
    let dir = tempfile::tempdir().unwrap();
    let (system, _) = start(Sensor::Stereo, config(Some(dir.path())));
    system.shutdown().unwrap();
    assert!(!dir.path().join("1Map.bin").exists());

    let (system, recorder) = start(Sensor::Stereo, config(Some(dir.path())));
    let img = image();
    system.track_stereo(&img, &img, 0.0).unwrap();
    system.activate_localization_mode();
    move_to(&recorder, 2.0);
    system.track_stereo(&img, &img, 0.1).unwrap();
    system.shutdown().unwrap();
    assert!(!dir.path().join("1Map.bin").exists());
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol and accessors
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_wrong_sensor_and_use_after_shutdown() {
    let (system, _) = start(Sensor::Stereo, config(None));
    let img = image();
    let err = system.track_monocular(&img, 0.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

    system.shutdown().unwrap();
    let err = system.track_stereo(&img, &img, 0.1).unwrap_err();
    assert!(matches!(err, SystemError::ProtocolViolation(_)));
}

#[test]
fn test_monocular_frame_trajectories_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (system, _) = start(Sensor::Monocular, config(None));
    system.track_monocular(&image(), 0.0).unwrap();
    let path = dir.path().join("CameraTrajectory.txt");
    assert_eq!(
        system.save_trajectory_tum(&path).unwrap_err().kind(),
        ErrorKind::ProtocolViolation
    );
    assert_eq!(
        system.save_trajectory_kitti(&path).unwrap_err().kind(),
        ErrorKind::ProtocolViolation
    );
    assert!(!path.exists());
    assert_eq!(system.save_keyframe_trajectory_tum(dir.path().join("kf.txt")).unwrap(), 1);
    assert!(dir.path().join("kf.yaml").exists());
}

#[test]
fn test_stereo_trajectories_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (system, recorder) = start(Sensor::Stereo, config(None));
    let img = image();
    for i in 0..3 {
        move_to(&recorder, i as f64);
        system.track_stereo(&img, &img, i as f64 * 0.1).unwrap();
    }
    system.shutdown().unwrap();

    let tum = dir.path().join("CameraTrajectory.txt");
    assert_eq!(system.save_trajectory_tum(&tum).unwrap(), 3);
    assert_eq!(system.save_trajectory_kitti(dir.path().join("kitti.txt")).unwrap(), 3);
    let last = std::fs::read_to_string(&tum).unwrap();
    assert!(last.lines().nth(2).unwrap().starts_with("0.200000 2.000000000"));
}

#[test]
fn test_map_changed_reports_each_big_change_once() {
    let (system, recorder) = start(Sensor::Stereo, config(None));
    assert!(!system.map_changed());

    let map = recorder.maps.lock()[0].clone();
    map.write().inform_new_big_change();
    assert!(system.map_changed());
    assert!(!system.map_changed());

    map.write().inform_new_big_change();
    map.write().inform_new_big_change();
    assert!(system.map_changed());
    assert!(!system.map_changed());
}

#[test]
fn test_snapshot_accessors() {
    let (system, recorder) = start(Sensor::Stereo, config(None));
    assert_eq!(system.tracking_state(), TrackingState::NoImagesYet);
    assert!(system.camera_center().is_none());

    let img = image();
    move_to(&recorder, 3.0);
    system.track_stereo(&img, &img, 0.0).unwrap();
    assert_eq!(system.tracking_state(), TrackingState::Ok);
    assert_eq!(system.camera_center(), Some(Vector3::new(3.0, 0.0, 0.0)));
    assert!(system.camera_rotation().is_some());
    assert!(system.tracked_map_points().is_empty());
    assert!(system.tracked_keypoints_un().is_empty());
}
