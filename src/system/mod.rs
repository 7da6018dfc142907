//! System orchestration and thread management.
//!
//! This module contains the top-level [`System`] that owns the active map
//! session, the worker contracts it drives, and the inter-thread messaging
//! types.

pub mod collaborators;
pub mod factory;
pub mod messages;
pub mod mode;
pub mod session;
pub mod shutdown;
pub mod snapshot;
pub mod worker_control;
mod slam_system;

pub use collaborators::{LocalMapping, LoopClosing, Viewer};
pub use factory::ReplayFactory;
pub use messages::NewKeyFrameMsg;
pub use mode::ModeRequest;
pub use session::{MapSession, SegmentFiles, SegmentId, SessionContext, SessionFactory, Subsystems};
pub use shutdown::ShutdownPhase;
pub use slam_system::System;
pub use worker_control::WorkerControl;
