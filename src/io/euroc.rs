//! EuRoC MAV dataset reader.
//!
//! Reads the `cam0` (and, when present, `cam1`) image lists, the ground truth
//! body poses and the cam0 extrinsics. Ground truth is turned into a
//! [`PoseTrack`] of camera poses for the replay tracker.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use image::GrayImage;
use nalgebra::{Matrix4, Vector3};
use serde::Deserialize;
use tracing::warn;

use crate::geometry::SE3;
use crate::tracking::PoseTrack;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct GroundTruthEntry {
    pub timestamp_ns: u64,
    /// Body pose in the world frame (T_wb).
    pub pose: SE3,
}

#[derive(Debug)]
pub struct EurocDataset {
    dataset_path: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    /// Empty when the sequence has no second camera.
    pub cam1_entries: Vec<ImageEntry>,
    pub groundtruth: Vec<GroundTruthEntry>,
    /// cam0 pose in the body frame (T_BS of `cam0/sensor.yaml`).
    pub t_body_cam0: SE3,
}

impl EurocDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;

        let cam1_csv = root.join("cam1/data.csv");
        let cam1_entries = if cam1_csv.exists() {
            let entries = load_image_list(cam1_csv)?;
            if entries.len() != cam0_entries.len() {
                bail!("cam0 and cam1 have different number of frames");
            }
            entries
        } else {
            Vec::new()
        };

        let groundtruth = load_groundtruth_list(root.join("state_groundtruth_estimate0/data.csv"))?;
        let t_body_cam0 = match load_extrinsics(&root.join("cam0/sensor.yaml")) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not load cam0 extrinsics: {}. Using identity.", e);
                SE3::identity()
            }
        };

        Ok(Self {
            dataset_path: root,
            cam0_entries,
            cam1_entries,
            groundtruth,
            t_body_cam0,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    pub fn has_stereo(&self) -> bool {
        !self.cam1_entries.is_empty()
    }

    /// Frame timestamp in seconds.
    pub fn frame_timestamp(&self, idx: usize) -> Option<f64> {
        self.cam0_entries.get(idx).map(|e| e.timestamp_ns as f64 * 1e-9)
    }

    pub fn left_image(&self, idx: usize) -> Result<GrayImage> {
        let entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("No left frame at index {}", idx))?;
        read_gray(&self.dataset_path.join("cam0/data").join(&entry.filename))
    }

    pub fn right_image(&self, idx: usize) -> Result<GrayImage> {
        let entry = self
            .cam1_entries
            .get(idx)
            .with_context(|| format!("No right frame at index {}", idx))?;
        read_gray(&self.dataset_path.join("cam1/data").join(&entry.filename))
    }

    /// Ground truth as cam0 poses, timestamps in seconds, with the first
    /// sample moved to the origin.
    ///
    /// T_world_cam = T_world_body * T_body_cam0
    pub fn camera_pose_track(&self) -> PoseTrack {
        let Some(first) = self.groundtruth.first() else {
            return PoseTrack::new(Vec::new());
        };
        let t_origin = first.pose.compose(&self.t_body_cam0).inverse();
        PoseTrack::new(
            self.groundtruth
                .iter()
                .map(|gt| {
                    let t_wc = gt.pose.compose(&self.t_body_cam0);
                    (gt.timestamp_ns as f64 * 1e-9, t_origin.compose(&t_wc))
                })
                .collect(),
        )
    }
}

fn read_gray(path: &Path) -> Result<GrayImage> {
    let img = image::open(path).with_context(|| format!("Failed to read image {:?}", path))?;
    Ok(img.into_luma8())
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let filename = rec[1].trim().to_string();
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename,
        });
    }
    Ok(entries)
}

fn load_groundtruth_list(csv_path: PathBuf) -> Result<Vec<GroundTruthEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // CSV format: timestamp, p_RS_R_x, p_RS_R_y, p_RS_R_z, q_RS_w, q_RS_x, q_RS_y, q_RS_z, ...
        if rec.len() < 8 {
            continue;
        }
        let ts: u64 = rec[0].trim().parse()?;
        let position = Vector3::new(
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
            rec[3].trim().parse()?,
        );

        // w-first quaternion
        let qw: f64 = rec[4].trim().parse()?;
        let qx: f64 = rec[5].trim().parse()?;
        let qy: f64 = rec[6].trim().parse()?;
        let qz: f64 = rec[7].trim().parse()?;

        entries.push(GroundTruthEntry {
            timestamp_ns: ts,
            pose: SE3::from_quaternion(qw, qx, qy, qz, position),
        });
    }
    Ok(entries)
}

/// EuRoC T_BS transform format: has cols, rows, data fields
#[derive(Debug, Deserialize)]
struct TransformYaml {
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CameraYaml {
    #[serde(rename = "T_BS")]
    t_bs: TransformYaml,
}

fn load_extrinsics(path: &Path) -> Result<SE3> {
    let cam: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )?;
    transform_from(&cam.t_bs.data)
}

fn transform_from(data: &[f64]) -> Result<SE3> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    let mat = Matrix4::from_row_slice(data);
    Ok(SE3::from_matrix(mat))
}
