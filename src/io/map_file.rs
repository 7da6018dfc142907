//! Binary map files.
//!
//! Layout: a small header (magic + schema version), the [`Map`] record, then
//! the [`KeyFrameDatabase`] record, all encoded with bincode. Entities refer
//! to each other by id only.
//!
//! Vocabulary handles and BoW vectors are not stored. [`load`] restores them
//! through the repair steps below, which are public so callers can rerun
//! them on a map that came from elsewhere.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::atlas::{KeyFrameDatabase, Map};
use crate::error::{Result, SystemError};
use crate::vocabulary::Vocabulary;

pub const MAGIC: [u8; 4] = *b"VSMP";
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    version: u32,
}

/// A map decoded and repaired, ready to back a new session.
pub struct LoadedMap {
    pub map: Map,
    pub keyframe_db: KeyFrameDatabase,
    /// First frame id the tracker may use.
    pub next_frame_id: u64,
    /// Camera distance from the origin at the newest live keyframe.
    pub recorded_extent: f64,
}

/// Write `map` and `keyframe_db` to `path`, creating parent directories.
pub fn save(path: &Path, map: &Map, keyframe_db: &KeyFrameDatabase) -> Result<()> {
    let write_err = |source: bincode::Error| SystemError::MapWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| write_err(e.into()))?;
    }
    let file = File::create(path).map_err(|e| write_err(e.into()))?;
    let mut writer = BufWriter::new(file);

    let header = Header {
        magic: MAGIC,
        version: VERSION,
    };
    bincode::serialize_into(&mut writer, &header).map_err(write_err)?;
    bincode::serialize_into(&mut writer, map).map_err(write_err)?;
    bincode::serialize_into(&mut writer, keyframe_db).map_err(write_err)?;
    writer.flush().map_err(|e| write_err(e.into()))?;

    info!(
        path = %path.display(),
        keyframes = map.num_keyframes(),
        map_points = map.num_map_points(),
        "Map saved"
    );
    Ok(())
}

/// Read a map file and run every repair step on it.
///
/// Returns `Ok(None)` when the file cannot be opened. Anything wrong after
/// opening is a [`SystemError::CorruptMap`].
pub fn load(path: &Path, vocabulary: &Arc<dyn Vocabulary>) -> Result<Option<LoadedMap>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot open map file");
            return Ok(None);
        }
    };
    let corrupt = |reason: String| SystemError::CorruptMap {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = BufReader::new(file);

    let header: Header =
        bincode::deserialize_from(&mut reader).map_err(|e| corrupt(format!("header: {e}")))?;
    if header.magic != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    if header.version != VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }

    let mut map: Map =
        bincode::deserialize_from(&mut reader).map_err(|e| corrupt(format!("map record: {e}")))?;
    let mut keyframe_db: KeyFrameDatabase = bincode::deserialize_from(&mut reader)
        .map_err(|e| corrupt(format!("keyframe database record: {e}")))?;

    rebind_vocabulary(&mut map, &mut keyframe_db, vocabulary);
    let with_bow = recompute_bow(&mut map);
    let next_frame_id = repair_id_counters(&mut map);
    let extent = recorded_extent(&map);

    info!(
        path = %path.display(),
        keyframes = map.num_keyframes(),
        next_frame_id,
        extent,
        "Map loaded"
    );
    debug!(with_bow, "BoW vectors recomputed");
    Ok(Some(LoadedMap {
        map,
        keyframe_db,
        next_frame_id,
        recorded_extent: extent,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Repair steps
// ─────────────────────────────────────────────────────────────────────────────

/// Bind the process-local vocabulary to the database and every keyframe.
pub fn rebind_vocabulary(map: &mut Map, keyframe_db: &mut KeyFrameDatabase, vocabulary: &Arc<dyn Vocabulary>) {
    keyframe_db.set_vocabulary(vocabulary.clone());
    for kf in map.keyframes_mut() {
        kf.set_vocabulary(vocabulary.clone());
    }
}

/// Recompute each keyframe's BoW vector from its stored descriptors.
/// Returns the number of keyframes that got one.
pub fn recompute_bow(map: &mut Map) -> usize {
    map.keyframes_mut()
        .map(|kf| kf.compute_bow())
        .filter(|computed| *computed)
        .count()
}

/// Restore the map's id counters. Returns the next frame id.
pub fn repair_id_counters(map: &mut Map) -> u64 {
    map.repair_id_counters()
}

/// Translation norm of the newest live keyframe, 0.0 for an empty map.
pub fn recorded_extent(map: &Map) -> f64 {
    map.keyframes_sorted()
        .into_iter()
        .rev()
        .find(|kf| !kf.is_bad)
        .map(|kf| kf.camera_center().norm())
        .unwrap_or(0.0)
}
