//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Completing keyframes inserted by Tracking (BoW, database entry)
//! - Creating map points and maintaining the covisibility graph
//! - Culling redundant keyframes
//!
//! Local bundle adjustment is not run by this worker.

mod local_mapper;

pub use local_mapper::{LocalMapper, LocalMapperHandle, LocalMapperStats};
