//! Serializable map graph of one map session.
//!
//! [`Map`] owns the [`KeyFrame`]s and [`MapPoint`]s. Every cross reference
//! (observations, covisibility, spanning tree parent and children) is a
//! [`KeyFrameId`] or [`MapPointId`], so the graph round-trips through the
//! map file without pointer fix-ups. Culled KeyFrames stay in the map,
//! flagged bad, with their pose relative to the parent kept for trajectory
//! reconstruction.

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
