//! Linearized discrete-time Kalman kernel over the quaternion state.
//!
//! The kernel owns the prior/posterior state vectors and error covariances
//! and nothing else. Process and observation artifacts (f, F, Q·Δt, z, h,
//! H, R) are built by the models around the current estimate and passed in
//! per call.

use nalgebra::{SMatrix, SVector};

// ---------------------------------------------------------------------------
// CONFIGURATION
// ---------------------------------------------------------------------------
pub type Scalar = f64;

/// State dimension: one unit quaternion (w, x, y, z).
pub const STATE_DIM: usize = 4;
/// Observation dimension: gravity block then magnetic block.
pub const OBS_DIM: usize = 6;

// Type Aliases
pub type StateVector = SVector<Scalar, STATE_DIM>;
pub type StateMatrix = SMatrix<Scalar, STATE_DIM, STATE_DIM>;
pub type ObsVector = SVector<Scalar, OBS_DIM>;
pub type ObsJacobian = SMatrix<Scalar, OBS_DIM, STATE_DIM>;
pub type ObsCovariance = SMatrix<Scalar, OBS_DIM, OBS_DIM>;

// ---------------------------------------------------------------------------
// STATUS
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterStatus {
    Updated,
    SingularMatrix,
}

// ---------------------------------------------------------------------------
// KERNEL
// ---------------------------------------------------------------------------
pub struct Ekf {
    pub x_prior: StateVector,
    pub x_post: StateVector,
    pub p_prior: StateMatrix,
    pub p_post: StateMatrix,
}

impl Ekf {
    /// Both states start at the identity quaternion; the prior covariance
    /// is seeded with the process-noise base.
    pub fn new(initial_cov: StateMatrix) -> Self {
        let identity = StateVector::new(1.0, 0.0, 0.0, 0.0);
        Self {
            x_prior: identity,
            x_post: identity,
            p_prior: initial_cov,
            p_post: StateMatrix::zeros(),
        }
    }

    /// Prediction step: `x_prior ← f`, `P_prior ← F·P_post·Fᵀ + Q_k`.
    ///
    /// The posterior state is left untouched; the caller decides whether to
    /// mirror the prediction into it.
    pub fn predict(&mut self, f: &StateVector, jacobian: &StateMatrix, noise: &StateMatrix) {
        self.x_prior = *f;
        self.p_prior = jacobian * self.p_post * jacobian.transpose() + noise;
    }

    /// Correction step against observation `z` with prediction `h`.
    ///
    /// Returns [`FilterStatus::SingularMatrix`] without touching the
    /// posterior when the innovation covariance cannot be inverted. The
    /// observation model keeps R positive definite, so that path is a
    /// caller-contract violation rather than a runtime condition.
    pub fn correct(
        &mut self,
        z: &ObsVector,
        h: &ObsVector,
        jacobian: &ObsJacobian,
        noise: &ObsCovariance,
    ) -> FilterStatus {
        let s = jacobian * self.p_prior * jacobian.transpose() + noise;

        if let Some(s_inv) = s.try_inverse() {
            let gain = self.p_prior * jacobian.transpose() * s_inv;
            self.x_post = self.x_prior + gain * (z - h);
            self.p_post = (StateMatrix::identity() - gain * jacobian) * self.p_prior;
            FilterStatus::Updated
        } else {
            FilterStatus::SingularMatrix
        }
    }
}
