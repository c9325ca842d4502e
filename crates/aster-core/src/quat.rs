//! Quaternion helpers shared by the filter and its output path.
//!
//! Quaternions are stored as plain 4-vectors in (w, x, y, z) order so the
//! kernel can treat them as ordinary filter state.

use libm::{atan2, sin, sqrt};
use nalgebra::Vector3;

use crate::ekf::{Scalar, StateVector};

/// Machine epsilon of the working precision.
pub const EPSILON: Scalar = Scalar::EPSILON;

/// Rotation published by the estimator: axis scaled by sin²(θ/2) and the
/// angle in degrees. The axis is the zero vector when the angle is zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisAngle {
    pub axis: Vector3<Scalar>,
    pub angle_deg: Scalar,
}

impl AxisAngle {
    pub const fn zero() -> Self {
        Self {
            axis: Vector3::new(0.0, 0.0, 0.0),
            angle_deg: 0.0,
        }
    }
}

impl Default for AxisAngle {
    fn default() -> Self {
        Self::zero()
    }
}

/// Scale `q` to unit norm in place.
///
/// A degenerate quaternion (norm below epsilon) is reset to the identity;
/// callers maintain the unit-norm invariant and should never reach that
/// branch.
pub fn normalize_quat(q: &mut StateVector) {
    let norm = sqrt(q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]);
    if norm > EPSILON {
        *q /= norm;
    } else {
        *q = StateVector::new(1.0, 0.0, 0.0, 0.0);
    }
}

/// Keep `q` on the same sign branch as the previous publication.
///
/// `q` and `-q` encode the same rotation; if `-q` is closer to the history
/// than `+q`, `q` is negated in place. The history is then overwritten with
/// the chosen representative. This prevents 2π flips in consumers that
/// difference successive quaternions.
pub fn shortest_path(history: &mut StateVector, q: &mut StateVector) {
    if q.dot(history) < 0.0 {
        *q = -*q;
    }
    *history = *q;
}

/// Convert a unit quaternion to the published axis-angle form.
pub fn to_axis_angle(q: &StateVector) -> AxisAngle {
    let s = sqrt(q[1] * q[1] + q[2] * q[2] + q[3] * q[3]);
    let theta = 2.0 * atan2(s, q[0]);
    if theta < EPSILON {
        return AxisAngle::zero();
    }
    let s_half = sin(theta / 2.0);
    AxisAngle {
        axis: Vector3::new(q[1] * s_half, q[2] * s_half, q[3] * s_half),
        angle_deg: theta.to_degrees(),
    }
}
