//! Trajectory export.
//!
//! Per-frame trajectories are rebuilt from the frame history: each record
//! holds the camera pose relative to its reference keyframe, and the
//! reference keyframe's current pose places it in the world. A culled
//! reference is replaced by walking up the spanning tree to a live ancestor.
//! Per-frame poses are expressed relative to the first keyframe, which may
//! have moved away from the origin after a loop closure.
//!
//! Formats:
//! - TUM: `timestamp tx ty tz qx qy qz qw`
//! - KITTI: 3x4 `[R|t]` row-major, 12 values per line
//! - Keyframe TUM plus a YAML side file with one camera centre per keyframe

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use nalgebra::Vector3;
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::atlas::map::{KeyFrame, KeyFrameId, Map};
use crate::error::{Result, SystemError};
use crate::geometry::SE3;
use crate::tracking::FrameHistory;

/// Pose of a keyframe that may have been culled, by way of its live
/// ancestor. None if the chain leaves the map.
pub fn reference_pose(map: &Map, kf_id: KeyFrameId) -> Option<SE3> {
    let mut kf = map.get_keyframe(kf_id)?;
    let mut t_live_ref = SE3::identity();
    while kf.is_bad {
        t_live_ref = kf.parent_relative?.compose(&t_live_ref);
        kf = map.get_keyframe(kf.parent_id?)?;
    }
    Some(kf.pose.compose(&t_live_ref))
}

/// World poses of the recorded frames, relative to the first live keyframe.
///
/// Lost frames are included only when `include_lost` is set. Frames whose
/// reference keyframe is no longer in the map are dropped.
pub fn frame_world_poses(map: &Map, history: &FrameHistory, include_lost: bool) -> Vec<(f64, SE3)> {
    let t_ow = first_live_keyframe(map)
        .map(|kf| kf.pose.inverse())
        .unwrap_or_else(SE3::identity);

    let mut dropped = 0usize;
    let poses: Vec<(f64, SE3)> = history
        .records()
        .iter()
        .filter(|record| include_lost || !record.lost)
        .filter_map(|record| {
            let Some(t_wr) = reference_pose(map, record.reference_kf) else {
                dropped += 1;
                return None;
            };
            let t_wc = t_wr.compose(&record.relative_pose);
            Some((record.timestamp, t_ow.compose(&t_wc)))
        })
        .collect();
    if dropped > 0 {
        warn!(dropped, "Frames with unknown reference keyframe skipped");
    }
    poses
}

fn first_live_keyframe(map: &Map) -> Option<&KeyFrame> {
    map.keyframes().filter(|kf| !kf.is_bad).min_by_key(|kf| kf.id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Writers
// ─────────────────────────────────────────────────────────────────────────────

/// TUM per-frame trajectory, lost frames skipped. Returns the line count.
pub fn write_tum<W: Write>(out: &mut W, map: &Map, history: &FrameHistory) -> io::Result<usize> {
    let poses = frame_world_poses(map, history, false);
    for (timestamp, pose) in &poses {
        let t = pose.translation;
        let q = pose.rotation;
        writeln!(
            out,
            "{:.6} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
    }
    Ok(poses.len())
}

/// KITTI per-frame trajectory. Lost frames are written with the last good
/// relative pose. Returns the line count.
pub fn write_kitti<W: Write>(out: &mut W, map: &Map, history: &FrameHistory) -> io::Result<usize> {
    let poses = frame_world_poses(map, history, true);
    for (_, pose) in &poses {
        let r = pose.rotation_matrix();
        let t = pose.translation;
        writeln!(
            out,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x,
            r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y,
            r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z
        )?;
    }
    Ok(poses.len())
}

/// Live keyframes in ascending id order, in TUM format. Returns the camera
/// centres written, in order.
pub fn write_keyframes_tum<W: Write>(out: &mut W, map: &Map) -> io::Result<Vec<Vector3<f64>>> {
    let mut centers = Vec::new();
    for kf in map.keyframes_sorted().into_iter().filter(|kf| !kf.is_bad) {
        let t = kf.camera_center();
        let q = kf.rotation_wc();
        writeln!(
            out,
            "{:.6} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
            kf.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
        centers.push(t);
    }
    Ok(centers)
}

/// `KeyFrame<i>: [x, y, z]` for each centre, then `NumberOfKeyFrames`.
pub fn keyframe_centers_yaml(centers: &[Vector3<f64>]) -> Mapping {
    let mut doc = Mapping::new();
    for (i, c) in centers.iter().enumerate() {
        let xyz = vec![Value::from(c.x), Value::from(c.y), Value::from(c.z)];
        doc.insert(Value::from(format!("KeyFrame{i}")), Value::Sequence(xyz));
    }
    doc.insert(
        Value::from("NumberOfKeyFrames"),
        Value::from(centers.len() as u64),
    );
    doc
}

pub fn write_keyframe_yaml<W: Write>(out: &mut W, centers: &[Vector3<f64>]) -> io::Result<()> {
    serde_yaml::to_writer(out, &keyframe_centers_yaml(centers))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

fn with_file<T>(path: &Path, body: impl FnOnce(&mut BufWriter<File>) -> io::Result<T>) -> Result<T> {
    let export_err = |source: io::Error| SystemError::Export {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(export_err)?;
    }
    let mut out = BufWriter::new(File::create(path).map_err(export_err)?);
    let value = body(&mut out).map_err(export_err)?;
    out.flush().map_err(export_err)?;
    Ok(value)
}

pub fn save_tum(path: &Path, map: &Map, history: &FrameHistory) -> Result<usize> {
    info!(path = %path.display(), "Saving camera trajectory");
    let lines = with_file(path, |out| write_tum(out, map, history))?;
    info!(lines, "Trajectory saved");
    Ok(lines)
}

pub fn save_kitti(path: &Path, map: &Map, history: &FrameHistory) -> Result<usize> {
    info!(path = %path.display(), "Saving camera trajectory");
    let lines = with_file(path, |out| write_kitti(out, map, history))?;
    info!(lines, "Trajectory saved");
    Ok(lines)
}

/// Keyframe trajectory to `path` and its camera centres to `yaml_path`.
pub fn save_keyframe_trajectory(path: &Path, yaml_path: &Path, map: &Map) -> Result<usize> {
    info!(path = %path.display(), "Saving keyframe trajectory");
    let centers = with_file(path, |out| write_keyframes_tum(out, map))?;
    with_file(yaml_path, |out| write_keyframe_yaml(out, &centers))?;
    info!(keyframes = centers.len(), "Keyframe trajectory saved");
    Ok(centers.len())
}

#[cfg(test)]
mod tests {
    use nalgebra::UnitQuaternion;

    use super::*;
    use crate::tracking::FrameRecord;

    fn at(x: f64, y: f64, z: f64) -> SE3 {
        SE3::from_rt(UnitQuaternion::identity(), Vector3::new(x, y, z))
    }

    fn record(kf: KeyFrameId, x: f64, timestamp: f64, lost: bool) -> FrameRecord {
        FrameRecord {
            relative_pose: at(x, 0.0, 0.0),
            reference_kf: kf,
            timestamp,
            lost,
        }
    }

    /// Root at (1, 0, 0), then two keyframes one metre apart along y.
    fn sample() -> (Map, Vec<KeyFrameId>) {
        let mut map = Map::new();
        let kf0 = map.create_keyframe(0, 0.0, at(1.0, 0.0, 0.0), vec![], None);
        let kf1 = map.create_keyframe(1, 1.0, at(1.0, 1.0, 0.0), vec![], Some(kf0));
        let kf2 = map.create_keyframe(2, 2.0, at(1.0, 2.0, 0.0), vec![], Some(kf1));
        (map, vec![kf0, kf1, kf2])
    }

    #[test]
    fn test_culled_reference_walks_to_live_ancestor() {
        let (mut map, ids) = sample();
        let before = reference_pose(&map, ids[1]).unwrap();
        assert!(map.set_bad_keyframe(ids[1]));
        let after = reference_pose(&map, ids[1]).unwrap();
        assert!((before.translation - after.translation).norm() < 1e-12);
    }

    #[test]
    fn test_tum_skips_lost_and_kitti_keeps_them() {
        let (map, ids) = sample();
        let mut history = FrameHistory::new();
        history.push(record(ids[0], 0.0, 0.0, false));
        history.push(record(ids[1], 0.5, 0.1, false));
        assert!(history.push_lost(0.2));
        history.push(record(ids[2], 0.0, 0.3, false));

        let mut tum = Vec::new();
        assert_eq!(write_tum(&mut tum, &map, &history).unwrap(), 3);
        let mut kitti = Vec::new();
        assert_eq!(write_kitti(&mut kitti, &map, &history).unwrap(), 4);

        let tum = String::from_utf8(tum).unwrap();
        let rows: Vec<Vec<f64>> = tum
            .lines()
            .map(|l| l.split(' ').map(|v| v.parse().unwrap()).collect())
            .collect();
        // Origin moved to the first keyframe.
        let expected = [
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            [0.1, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            [0.3, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        ];
        for (row, want) in rows.iter().zip(expected.iter()) {
            assert_eq!(row.len(), 8);
            for (got, want) in row.iter().zip(want.iter()) {
                assert!((got - want).abs() < 1e-9, "{tum}");
            }
        }
        assert!(tum.lines().next().unwrap().starts_with("0.000000 "));

        let kitti = String::from_utf8(kitti).unwrap();
        let row: Vec<&str> = kitti.lines().nth(3).unwrap().split(' ').collect();
        assert_eq!(row.len(), 12);
        assert_eq!(row[7], "2.000000000");
    }

    #[test]
    fn test_keyframe_trajectory_skips_culled() {
        let (mut map, ids) = sample();
        map.set_bad_keyframe(ids[1]);

        let mut out = Vec::new();
        let centers = write_keyframes_tum(&mut out, &map).unwrap();
        assert_eq!(centers.len(), 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            "0.000000 1.0000000 0.0000000 0.0000000 0.0000000 0.0000000 0.0000000 1.0000000"
        );
        assert!(text.lines().nth(1).unwrap().starts_with("2.000000 1.0000000 2.0000000"));

        let yaml = keyframe_centers_yaml(&centers);
        assert_eq!(yaml.get("NumberOfKeyFrames"), Some(&Value::from(2u64)));
        let second = yaml.get("KeyFrame1").unwrap().as_sequence().unwrap();
        assert_eq!(second[1].as_f64(), Some(2.0));
        assert!(yaml.get("KeyFrame2").is_none());
    }

    #[test]
    fn test_save_keyframe_trajectory_files() {
        let dir = tempfile::tempdir().unwrap();
        let (map, _) = sample();
        let txt = dir.path().join("out/1KeyFrameTrajectory.txt");
        let yaml = dir.path().join("out/1KeyFrameTrajectory.yaml");
        assert_eq!(save_keyframe_trajectory(&txt, &yaml, &map).unwrap(), 3);
        assert_eq!(fs::read_to_string(&txt).unwrap().lines().count(), 3);

        let doc: Mapping = serde_yaml::from_str(&fs::read_to_string(&yaml).unwrap()).unwrap();
        assert_eq!(doc.get("NumberOfKeyFrames").and_then(Value::as_u64), Some(3));
    }

    #[test]
    fn test_unwritable_export_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let (map, _) = sample();
        let err = save_tum(&blocker.join("traj.txt"), &map, &FrameHistory::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RecoverableIo);
    }
}
