//! File formats: map segments, trajectories and the EuRoC dataset layout.

pub mod euroc;
pub mod map_file;
pub mod trajectory;

pub use map_file::LoadedMap;
