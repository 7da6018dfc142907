use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use vslam_orchestrator::io::euroc::EurocDataset;
use vslam_orchestrator::system::ReplayFactory;
use vslam_orchestrator::{ErrorKind, Sensor, System, SystemConfig, SystemError};

const USAGE: &str =
    "usage: vslam-orchestrator <vocabulary.txt> <settings.yaml> <euroc/mav0> [monocular|stereo]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vslam_orchestrator=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        bail!(USAGE);
    }
    let sensor = match args.get(4).map(String::as_str) {
        None | Some("monocular") => Sensor::Monocular,
        Some("stereo") => Sensor::Stereo,
        Some(other) => bail!("unsupported sensor '{}'\n{}", other, USAGE),
    };

    let dataset = EurocDataset::new(&args[3])
        .with_context(|| format!("Loading EuRoC dataset from {}", args[3]))?;
    if sensor == Sensor::Stereo && !dataset.has_stereo() {
        bail!("stereo requested but the sequence has no cam1");
    }
    info!(
        frames = dataset.len(),
        groundtruth = dataset.groundtruth.len(),
        "Dataset loaded"
    );

    let config = SystemConfig::from_yaml_file(&args[2])?;
    let factory = ReplayFactory::new(config.replay.clone(), Arc::new(dataset.camera_pose_track()));
    let system = System::from_files(&args[1], &args[2], sensor, Box::new(factory))?;

    let start = Instant::now();
    let mut tracked = 0usize;
    for idx in 0..dataset.len() {
        let Some(timestamp) = dataset.frame_timestamp(idx) else {
            continue;
        };
        let left = dataset.left_image(idx)?;
        let result = match sensor {
            Sensor::Stereo => system.track_stereo(&left, &dataset.right_image(idx)?, timestamp),
            _ => system.track_monocular(&left, timestamp),
        };
        match result {
            Ok(Some(_)) => tracked += 1,
            Ok(None) => {}
            Err(e) => check_error(e)?,
        }
    }
    info!(
        frames = dataset.len(),
        tracked,
        elapsed_s = start.elapsed().as_secs_f64(),
        state = ?system.tracking_state(),
        "Sequence finished"
    );

    system.shutdown()?;

    if let Err(e) = system.save_keyframe_trajectory_tum("KeyFrameTrajectory.txt") {
        check_error(e)?;
    }
    if sensor != Sensor::Monocular {
        if let Err(e) = system.save_trajectory_tum("CameraTrajectory.txt") {
            check_error(e)?;
        }
    }
    Ok(())
}

/// Keep going on recoverable errors, stop on everything else.
fn check_error(e: SystemError) -> Result<()> {
    match e.kind() {
        ErrorKind::RecoverableIo => {
            warn!(error = %e, "Continuing after error");
            Ok(())
        }
        _ => Err(e.into()),
    }
}
