//! LoopCloser - Main loop closing thread.
//!
//! This module implements the loop closing thread that:
//! 1. Receives keyframes from LocalMapping
//! 2. Detects loop candidates using BoW
//! 3. Confirms them with the temporal consistency check
//! 4. Marks the map with a big change when a loop is accepted
//!
//! Pose graph correction and global bundle adjustment are not part of this
//! worker, so [`LoopCloserHandle::is_running_gba`] is always false.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::atlas::map::KeyFrameId;
use crate::atlas::{SharedKeyFrameDb, SharedMap};
use crate::system::collaborators::LoopClosing;
use crate::system::session::SessionContext;
use crate::system::worker_control::WorkerControl;

use super::detector::{detect_loop_candidates, ConsistencyChecker, LoopDetectorConfig};

/// Timeout for receiving keyframes from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(20);

/// Configuration for the LoopCloser.
#[derive(Debug, Clone, Default)]
pub struct LoopCloserConfig {
    /// Loop detection configuration.
    pub detector: LoopDetectorConfig,
}

/// Statistics for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Number of keyframes processed.
    pub keyframes_processed: usize,

    /// Number of loop candidates detected.
    pub candidates_detected: usize,

    /// Number of loops that passed the consistency check.
    pub loops_accepted: usize,
}

/// The LoopCloser thread handler.
pub struct LoopCloser {
    map: SharedMap,
    keyframe_db: SharedKeyFrameDb,
    control: Arc<WorkerControl>,
    config: LoopCloserConfig,

    /// Consistency checker for temporal validation.
    consistency_checker: ConsistencyChecker,

    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(ctx: &SessionContext, control: Arc<WorkerControl>, config: LoopCloserConfig) -> Self {
        let consistency_checker = ConsistencyChecker::new(config.detector.consistency_threshold);
        Self {
            map: ctx.map.clone(),
            keyframe_db: ctx.keyframe_db.clone(),
            control,
            config,
            consistency_checker,
            stats: LoopCloserStats::default(),
        }
    }

    /// Run the main loop closing thread.
    ///
    /// Blocks until finish is requested or Local Mapping drops its sender.
    pub fn run(&mut self, kf_receiver: Receiver<KeyFrameId>) {
        info!("LoopCloser thread started");

        loop {
            if self.control.is_finish_requested() {
                break;
            }

            if self.control.is_reset_requested() {
                self.reset(&kf_receiver);
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    self.process_keyframe(kf_id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("LoopCloser channel disconnected");
                    break;
                }
            }
        }

        self.control.set_finished();
        info!(
            processed = self.stats.keyframes_processed,
            detected = self.stats.candidates_detected,
            accepted = self.stats.loops_accepted,
            "LoopCloser thread exiting"
        );
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }

    /// Forget queued keyframes and consistency groups from the cleared map.
    fn reset(&mut self, kf_receiver: &Receiver<KeyFrameId>) {
        let dropped = kf_receiver.try_iter().count();
        self.consistency_checker.clear();
        info!(dropped, "Loop Closing RESET");
        self.control.acknowledge_reset();
    }

    /// Process a single keyframe. Returns the accepted loop keyframe, if any.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> Option<KeyFrameId> {
        self.stats.keyframes_processed += 1;

        let candidates = {
            let map = self.map.read();
            let db = self.keyframe_db.read();
            detect_loop_candidates(kf_id, &map, &db, &self.config.detector)
        };
        self.stats.candidates_detected += candidates.len();

        let accepted = self.consistency_checker.add_and_check(&candidates)?;
        self.stats.loops_accepted += 1;
        info!(
            current = %accepted.current_kf_id,
            loop_kf = %accepted.loop_kf_id,
            score = accepted.bow_score,
            "Loop detected"
        );
        self.map.write().inform_new_big_change();
        Some(accepted.loop_kf_id)
    }
}

/// Orchestrator-side handle of a running [`LoopCloser`].
pub struct LoopCloserHandle {
    control: Arc<WorkerControl>,
}

impl LoopCloserHandle {
    pub fn new(control: Arc<WorkerControl>) -> Self {
        Self { control }
    }
}

impl LoopClosing for LoopCloserHandle {
    fn request_finish(&self) {
        self.control.request_finish();
    }

    fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    fn is_running_gba(&self) -> bool {
        false
    }

    fn reset(&self) {
        self.control.request_reset();
        self.control.wait_until_reset();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crossbeam_channel::bounded;

    use super::*;
    use crate::geometry::SE3;
    use crate::system::collaborators::poll_until;
    use crate::tracking::Sensor;
    use crate::vocabulary::{BowVector, Descriptor, Vocabulary};

    struct FirstByteVocabulary;

    impl Vocabulary for FirstByteVocabulary {
        fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
            let mut bow = BowVector::new();
            for d in descriptors {
                *bow.entry(d[0] as u32).or_insert(0.0) += 1.0 / descriptors.len() as f64;
            }
            bow
        }

        fn num_words(&self) -> usize {
            256
        }
    }

    /// A chain of keyframes where the last `revisits` look like keyframe 0.
    fn revisiting_session(len: u64, revisits: u64) -> (SessionContext, Vec<KeyFrameId>) {
        let ctx = SessionContext::fresh(Sensor::Stereo, Arc::new(FirstByteVocabulary), false);
        let mut ids = Vec::new();
        {
            let mut map = ctx.map.write();
            let mut db = ctx.keyframe_db.write();
            for i in 0..len {
                let word = if i >= len - revisits { 0 } else { i as u8 };
                let id = map.create_keyframe(i, i as f64, SE3::identity(), vec![[word; 32]], ids.last().copied());
                let kf = map.get_keyframe_mut(id).unwrap();
                kf.set_vocabulary(ctx.vocabulary.clone());
                kf.compute_bow();
                db.add(id, kf.bow_vector().unwrap());
                ids.push(id);
            }
        }
        (ctx, ids)
    }

    #[test]
    fn test_consistent_loop_marks_big_change() {
        let (ctx, ids) = revisiting_session(20, 3);
        let mut closer = LoopCloser::new(&ctx, Arc::new(WorkerControl::new()), LoopCloserConfig::default());

        assert!(closer.process_keyframe(ids[17]).is_none());
        assert!(closer.process_keyframe(ids[18]).is_none());
        assert_eq!(ctx.map.read().last_big_change_idx(), 0);

        assert_eq!(closer.process_keyframe(ids[19]), Some(ids[0]));
        assert_eq!(closer.stats().loops_accepted, 1);
        assert_eq!(ctx.map.read().last_big_change_idx(), 1);
    }

    #[test]
    fn test_reset_drops_queue_and_consistency_groups() {
        let (ctx, ids) = revisiting_session(20, 3);
        let control = Arc::new(WorkerControl::new());
        let mut closer = LoopCloser::new(&ctx, control.clone(), LoopCloserConfig::default());
        assert!(closer.process_keyframe(ids[17]).is_none());
        assert!(closer.process_keyframe(ids[18]).is_none());

        // Queued before the reset: accepting it would close a loop.
        let (tx, rx) = bounded(4);
        tx.send(ids[19]).unwrap();
        control.request_reset();
        let worker = thread::spawn(move || {
            closer.run(rx);
            closer
        });
        control.wait_until_reset();
        assert!(tx.is_empty());
        control.request_finish();
        let mut closer = worker.join().unwrap();

        assert_eq!(closer.stats().keyframes_processed, 2);
        assert_eq!(ctx.map.read().last_big_change_idx(), 0);
        assert!(closer.process_keyframe(ids[19]).is_none());
    }

    #[test]
    fn test_run_exits_on_finish() {
        let (ctx, ids) = revisiting_session(12, 0);
        let control = Arc::new(WorkerControl::new());
        let handle = LoopCloserHandle::new(control.clone());
        let (tx, rx) = bounded(4);
        let mut closer = LoopCloser::new(&ctx, control, LoopCloserConfig::default());
        let worker = thread::spawn(move || {
            closer.run(rx);
            closer.stats().keyframes_processed
        });

        tx.send(ids[11]).unwrap();
        poll_until(Duration::from_millis(1), || tx.is_empty());
        handle.request_finish();
        poll_until(Duration::from_millis(1), || handle.is_finished());
        assert!(!handle.is_running_gba());
        assert!(worker.join().unwrap() <= 1);
    }
}
