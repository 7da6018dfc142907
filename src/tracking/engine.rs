//! Contract between the orchestrator and a tracking front-end.

use std::fmt;

use image::{GrayImage, ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use crate::atlas::map::MapPointId;
use crate::geometry::SE3;

use super::history::FrameHistory;
use super::state::TrackingState;

/// Depth image in metres, one value per pixel.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Camera configuration, fixed for the lifetime of a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Monocular => "Monocular",
            Self::Stereo => "Stereo",
            Self::Rgbd => "RGB-D",
        };
        f.write_str(name)
    }
}

/// The images making up one frame.
#[derive(Debug, Clone, Copy)]
pub enum SensorInput<'a> {
    Monocular {
        image: &'a GrayImage,
    },
    Stereo {
        left: &'a GrayImage,
        right: &'a GrayImage,
    },
    Rgbd {
        image: &'a GrayImage,
        depth: &'a DepthImage,
    },
}

impl SensorInput<'_> {
    pub fn sensor(&self) -> Sensor {
        match self {
            Self::Monocular { .. } => Sensor::Monocular,
            Self::Stereo { .. } => Sensor::Stereo,
            Self::Rgbd { .. } => Sensor::Rgbd,
        }
    }

    /// Image features are extracted from (left image for stereo).
    pub fn primary_image(&self) -> &GrayImage {
        match self {
            Self::Monocular { image } | Self::Rgbd { image, .. } => image,
            Self::Stereo { left, .. } => left,
        }
    }
}

/// Undistorted keypoint in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub octave: i32,
}

/// Per-feature observations of the last processed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedObservations {
    /// `map_points[i]` is the MapPoint matched to keypoint `i`, if any.
    pub map_points: Vec<Option<MapPointId>>,
    pub keypoints_un: Vec<KeyPoint>,
}

impl TrackedObservations {
    pub fn num_tracked(&self) -> usize {
        self.map_points.iter().filter(|mp| mp.is_some()).count()
    }
}

/// Tracking front-end driven by the orchestrator on the caller's thread.
pub trait TrackingEngine: Send {
    /// Process one frame. Returns the estimated camera pose (T_wc), or `None`
    /// when tracking failed for this frame.
    fn grab_frame(&mut self, input: &SensorInput<'_>, timestamp: f64) -> Option<SE3>;

    fn state(&self) -> TrackingState;

    fn current_observations(&self) -> TrackedObservations;

    /// Pose of the last successfully tracked frame, if the last frame was
    /// tracked.
    fn current_camera_pose(&self) -> Option<SE3>;

    fn history(&self) -> &FrameHistory;

    /// Switch between full SLAM and localization against the existing map.
    fn inform_only_tracking(&mut self, only_tracking: bool);

    fn is_only_tracking(&self) -> bool;

    /// Drop the current map, keyframe database and frame history.
    fn reset(&mut self);
}
