//! # Aster Core
//!
//! Quaternion-state extended Kalman filter that fuses three asynchronous
//! sensor streams (gyroscope, accelerometer, optional magnetometer) into a
//! drift-corrected orientation. This crate contains only the estimation
//! core; sensor discovery and delivery belong to a platform layer that
//! pushes timestamped samples into [`Estimator`].
//!
//! - Gyroscope samples drive the prediction step.
//! - Accelerometer samples drive the correction step against gravity,
//!   consuming the latest magnetometer reading if one is pending.
//! - Magnetometer samples are only stashed; they never step the filter.
//!
//! # Features
//! - `std`: Enable standard library support (default)
//! - Without `std`: `no_std` operation, float math via `libm`

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod ekf;
pub mod estimator;
pub mod model;
pub mod quat;

// Re-export core types
pub use ekf::{Ekf, FilterStatus, ObsCovariance, ObsJacobian, ObsVector, Scalar, StateMatrix, StateVector};
pub use estimator::{Estimator, EstimatorConfig};
pub use model::{MagConditioner, ObservationStep, ProcessStep, GRAVITY};
pub use quat::AxisAngle;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
