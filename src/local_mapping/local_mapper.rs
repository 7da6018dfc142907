//! Local Mapper - Main Local Mapping thread implementation.
//!
//! Processes keyframes received from Tracking:
//! 1. Computes the BoW vector and indexes the keyframe in the database
//! 2. Creates map points from descriptor matches with the parent keyframe
//! 3. Updates covisibility graph (automatic via associate)
//! 4. Keyframe culling (removes redundant keyframes)
//! 5. Forwards the keyframe to Loop Closing
//!
//! Stop / release / reset / finish requests are honored between keyframes
//! through the worker's [`WorkerControl`].

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::atlas::{SharedKeyFrameDb, SharedMap};
use crate::system::collaborators::LocalMapping;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::session::SessionContext;
use crate::system::worker_control::WorkerControl;
use crate::tracking::matching::{match_descriptors, TH_LOW};
use crate::vocabulary::{Descriptor, Vocabulary};

/// Timeout for receiving keyframes. Allows periodic finish/stop checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(20);

/// A map point is redundant in a keyframe once this many other keyframes
/// observe it.
const REDUNDANT_OBSERVATIONS: usize = 3;

/// Share of redundant map points that makes a keyframe redundant.
const REDUNDANT_RATIO: f64 = 0.9;

#[derive(Debug, Default, Clone)]
pub struct LocalMapperStats {
    pub keyframes_processed: usize,
    pub map_points_created: usize,
    pub keyframes_culled: usize,
}

/// Local Mapping thread state.
pub struct LocalMapper {
    map: SharedMap,
    keyframe_db: SharedKeyFrameDb,
    vocabulary: Arc<dyn Vocabulary>,
    control: Arc<WorkerControl>,

    /// Channel sender to Loop Closing thread.
    lc_sender: Option<Sender<KeyFrameId>>,

    stats: LocalMapperStats,
}

impl LocalMapper {
    /// # Arguments
    /// * `ctx` - Session whose map and database this mapper maintains
    /// * `control` - Handshake shared with the [`LocalMapperHandle`]
    /// * `lc_sender` - Optional sender to forward keyframe IDs to Loop Closing
    pub fn new(
        ctx: &SessionContext,
        control: Arc<WorkerControl>,
        lc_sender: Option<Sender<KeyFrameId>>,
    ) -> Self {
        Self {
            map: ctx.map.clone(),
            keyframe_db: ctx.keyframe_db.clone(),
            vocabulary: ctx.vocabulary.clone(),
            control,
            lc_sender,
            stats: LocalMapperStats::default(),
        }
    }

    /// Main thread loop: receive keyframes and process them.
    ///
    /// This runs until finish is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>) {
        info!("LocalMapper thread started");
        loop {
            if self.control.is_finish_requested() {
                break;
            }

            if self.control.is_reset_requested() {
                self.reset(&kf_receiver);
                continue;
            }

            if self.control.stop_if_requested() {
                info!("Local Mapping STOP");
                self.control.wait_while_stopped();
                if !self.control.is_finish_requested() {
                    info!("Local Mapping RELEASE");
                }
                continue;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.process_keyframe(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Dropping the sender lets Loop Closing see the end of the stream.
        self.lc_sender = None;
        self.control.set_finished();
        info!(
            processed = self.stats.keyframes_processed,
            map_points = self.stats.map_points_created,
            culled = self.stats.keyframes_culled,
            "LocalMapper thread exiting"
        );
    }

    pub fn stats(&self) -> &LocalMapperStats {
        &self.stats
    }

    /// Drop keyframes queued before the map was cleared. Their ids would
    /// otherwise refer to keyframes created after the reset.
    fn reset(&mut self, kf_receiver: &Receiver<NewKeyFrameMsg>) {
        let dropped = kf_receiver.try_iter().count();
        info!(dropped, "Local Mapping RESET");
        self.control.acknowledge_reset();
    }

    /// Process a single keyframe message.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg) {
        let kf_id = msg.keyframe_id;
        if !self.index_keyframe(kf_id) {
            debug!(%kf_id, "Keyframe gone before processing, skipped");
            return;
        }

        self.stats.map_points_created += self.create_map_points(kf_id);

        let culled = self.cull_keyframes(kf_id);
        self.stats.keyframes_culled += culled.len();

        self.stats.keyframes_processed += 1;

        if let Some(sender) = &self.lc_sender {
            if let Err(TrySendError::Full(_)) = sender.try_send(kf_id) {
                warn!(%kf_id, "Loop Closing queue full, keyframe skipped");
            }
        }
    }

    /// Compute the BoW vector and add the keyframe to the database.
    fn index_keyframe(&self, kf_id: KeyFrameId) -> bool {
        let bow = {
            let mut map = self.map.write();
            let Some(kf) = map.get_keyframe_mut(kf_id) else {
                return false;
            };
            kf.set_vocabulary(self.vocabulary.clone());
            kf.compute_bow();
            match kf.bow_vector() {
                Some(bow) => bow.clone(),
                None => return false,
            }
        };
        self.keyframe_db.write().add(kf_id, &bow);
        true
    }

    /// Create map points from descriptor matches with the parent keyframe.
    ///
    /// The replayed frames carry no depth, so a new point is anchored midway
    /// between the two observing camera centres.
    fn create_map_points(&self, kf_id: KeyFrameId) -> usize {
        let mut map = self.map.write();

        let pairs: Vec<(usize, usize, Option<MapPointId>, Descriptor)>;
        let (parent_id, anchor) = {
            let Some(kf) = map.get_keyframe(kf_id) else {
                return 0;
            };
            let Some(parent) = kf.parent_id.and_then(|id| map.get_keyframe(id)) else {
                return 0;
            };
            pairs = match_descriptors(&kf.descriptors, &parent.descriptors, TH_LOW)
                .into_iter()
                .map(|(qi, ti)| (qi, ti, parent.get_map_point(ti), kf.descriptors[qi]))
                .collect();
            (parent.id, (kf.camera_center() + parent.camera_center()) / 2.0)
        };

        let mut created = 0;
        for (feature_idx, parent_idx, existing, descriptor) in pairs {
            let mp_id = match existing {
                Some(mp_id) => mp_id,
                None => {
                    let mp_id = map.create_map_point(anchor, descriptor, parent_id);
                    map.associate(parent_id, parent_idx, mp_id);
                    created += 1;
                    mp_id
                }
            };
            map.associate(kf_id, feature_idx, mp_id);
        }
        created
    }

    /// Cull covisible keyframes whose map points are almost all seen by
    /// enough other keyframes.
    fn cull_keyframes(&self, kf_id: KeyFrameId) -> Vec<KeyFrameId> {
        let mut map = self.map.write();
        let neighbors: Vec<KeyFrameId> = map
            .get_keyframe(kf_id)
            .map(|kf| kf.covisibles().copied().collect())
            .unwrap_or_default();

        let mut culled = Vec::new();
        for id in neighbors {
            let redundant = {
                let Some(kf) = map.get_keyframe(id) else {
                    continue;
                };
                if kf.is_bad || kf.is_root() {
                    continue;
                }
                let points: Vec<MapPointId> = kf.map_point_ids.iter().flatten().copied().collect();
                if points.is_empty() {
                    continue;
                }
                let n_redundant = points
                    .iter()
                    .filter_map(|mp_id| map.get_map_point(*mp_id))
                    .filter(|mp| {
                        mp.observations
                            .keys()
                            .filter(|obs| **obs != id)
                            .filter(|obs| map.get_keyframe(**obs).is_some_and(|k| !k.is_bad))
                            .count()
                            >= REDUNDANT_OBSERVATIONS
                    })
                    .count();
                n_redundant as f64 > REDUNDANT_RATIO * points.len() as f64
            };
            if redundant && map.set_bad_keyframe(id) {
                debug!(kf_id = %id, "Culled redundant keyframe");
                culled.push(id);
            }
        }
        drop(map);

        if !culled.is_empty() {
            let mut db = self.keyframe_db.write();
            for id in &culled {
                db.erase(*id);
            }
        }
        culled
    }
}

/// Orchestrator-side handle of a running [`LocalMapper`].
pub struct LocalMapperHandle {
    control: Arc<WorkerControl>,
}

impl LocalMapperHandle {
    pub fn new(control: Arc<WorkerControl>) -> Self {
        Self { control }
    }
}

impl LocalMapping for LocalMapperHandle {
    fn request_stop(&self) {
        self.control.request_stop();
    }

    fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    fn release(&self) {
        self.control.release();
    }

    fn request_finish(&self) {
        self.control.request_finish();
    }

    fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Woken by the worker instead of polling.
    fn wait_until_stopped(&self, _poll: Duration) {
        self.control.wait_until_stopped();
    }

    fn reset(&self) {
        self.control.request_reset();
        self.control.wait_until_reset();
    }
}
