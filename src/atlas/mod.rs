//! Map storage shared by the workers of a map session.
//!
//! - [`map::Map`] - KeyFrames and MapPoints with covisibility and spanning tree
//! - [`keyframe_db::KeyFrameDatabase`] - BoW inverted index for place recognition
//!
//! Both are handed out as [`SharedMap`] / [`SharedKeyFrameDb`] so Tracking,
//! Local Mapping and Loop Closing can work on the same session concurrently.

pub mod keyframe_db;
pub mod map;

use std::sync::Arc;

use parking_lot::RwLock;

pub use keyframe_db::KeyFrameDatabase;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};

/// Map handle shared across the threads of one session.
pub type SharedMap = Arc<RwLock<Map>>;

/// KeyFrame database handle shared across the threads of one session.
pub type SharedKeyFrameDb = Arc<RwLock<KeyFrameDatabase>>;
