//! Aster Simulation Library
//!
//! Generates timestamped gyro/accel/mag sample streams at independent
//! rates and replays them through the orientation estimator.

pub mod replay;
pub mod streams;

// Re-export main types
pub use replay::{run_replay, ReplayResult};
pub use streams::{generate_samples, ScenarioConfig, SensorSample};
