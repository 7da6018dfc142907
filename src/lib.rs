pub mod atlas;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use config::SystemConfig;
pub use error::{ErrorKind, Result, SystemError};
pub use system::System;
pub use tracking::Sensor;
