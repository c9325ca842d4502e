//! Process and observation models evaluated around the current estimate.
//!
//! Both models produce plain value structs that are handed to the kernel,
//! so the linearization point is explicit at every call site.

use libm::{acos, fabs};
use nalgebra::Vector3;

use crate::ekf::{ObsCovariance, ObsJacobian, ObsVector, Scalar, StateMatrix, StateVector};
use crate::estimator::EstimatorConfig;
use crate::quat::{normalize_quat, EPSILON};

/// Gravity magnitude assumed by the observation model (m/s²).
pub const GRAVITY: Scalar = 9.81;

// ---------------------------------------------------------------------------
// PROCESS MODEL
// ---------------------------------------------------------------------------

/// Artifacts of one prediction step.
pub struct ProcessStep {
    /// Next-state quaternion f(x, ω), normalized.
    pub state: StateVector,
    /// Transition Jacobian F = ∂f/∂x.
    pub jacobian: StateMatrix,
    /// Process noise Q·Δt.
    pub noise: StateMatrix,
}

/// Integrate the posterior quaternion over `dt` with body rate `rate`
/// (rad/s): f = q + (Δt/2)·Ω(ω)·q.
pub fn process_step(
    x_post: &StateVector,
    rate: &Vector3<Scalar>,
    dt: Scalar,
    q_diag: Scalar,
) -> ProcessStep {
    let (q0, q1, q2, q3) = (x_post[0], x_post[1], x_post[2], x_post[3]);
    let (wx, wy, wz) = (rate.x, rate.y, rate.z);
    let c = 0.5 * dt;

    let mut state = StateVector::new(
        q0 + c * (-q1 * wx - q2 * wy - q3 * wz),
        q1 + c * (q0 * wx - q3 * wy + q2 * wz),
        q2 + c * (q3 * wx + q0 * wy - q1 * wz),
        q3 + c * (-q2 * wx + q1 * wy + q0 * wz),
    );
    normalize_quat(&mut state);

    #[rustfmt::skip]
    let jacobian = StateMatrix::new(
        1.0,     -c * wx, -c * wy, -c * wz,
        c * wx,  1.0,      c * wz, -c * wy,
        c * wy,  -c * wz, 1.0,      c * wx,
        c * wz,   c * wy, -c * wx,  1.0,
    );

    ProcessStep {
        state,
        jacobian,
        noise: StateMatrix::identity() * (q_diag * dt),
    }
}

// ---------------------------------------------------------------------------
// MAGNETOMETER CONDITIONER
// ---------------------------------------------------------------------------

/// Running statistics of the magnetic field plus the horizontal projection
/// of the latest reading.
///
/// Owns the exponentially smoothed field-magnitude and dip-angle means that
/// feed the adaptive measurement noise. Both means are sentinel-initialized
/// to -1 so the first reading primes them directly.
pub struct MagConditioner {
    norm_mean: Scalar,
    dip_mean: Scalar,
    alpha: Scalar,
}

/// Output of conditioning one magnetometer reading.
pub struct MagTerms {
    /// Field with the vertical component rejected, normalized when possible.
    pub horizontal: Vector3<Scalar>,
    /// |‖m‖ − m̄| after the mean update.
    pub norm_dev: Scalar,
    /// |δ − δ̄| after the mean update, radians.
    pub dip_dev: Scalar,
}

impl MagConditioner {
    pub fn new(alpha: Scalar) -> Self {
        Self {
            norm_mean: -1.0,
            dip_mean: -1.0,
            alpha,
        }
    }

    /// Condition a reading against the estimated vertical (third DCM
    /// column). Updates the running means first, then reports deviations
    /// from the smoothed values.
    pub fn condition(
        &mut self,
        field: &Vector3<Scalar>,
        field_norm: Scalar,
        vertical: &Vector3<Scalar>,
    ) -> MagTerms {
        let down = field.dot(vertical);

        let mut dip = acos(down / field_norm);
        if dip.is_nan() {
            dip = 0.0;
        }

        if self.norm_mean < 0.0 {
            self.norm_mean = field_norm;
        } else {
            self.norm_mean = self.alpha * self.norm_mean + (1.0 - self.alpha) * field_norm;
        }
        if self.dip_mean < 0.0 {
            self.dip_mean = dip;
        } else {
            self.dip_mean = self.alpha * self.dip_mean + (1.0 - self.alpha) * dip;
        }

        // Reject the component along the vertical, keep the heading part.
        let mut horizontal = field - down * vertical;
        let norm = horizontal.norm();
        if norm > EPSILON {
            horizontal /= norm;
        }

        MagTerms {
            horizontal,
            norm_dev: fabs(field_norm - self.norm_mean),
            dip_dev: fabs(dip - self.dip_mean),
        }
    }

    pub fn norm_mean(&self) -> Scalar {
        self.norm_mean
    }

    pub fn dip_mean(&self) -> Scalar {
        self.dip_mean
    }
}

// ---------------------------------------------------------------------------
// OBSERVATION MODEL
// ---------------------------------------------------------------------------

/// Artifacts of one correction step.
pub struct ObservationStep {
    /// Observation vector z: accel reading, then horizontal mag (or zeros).
    pub z: ObsVector,
    /// Predicted observation h(x_prior).
    pub predicted: ObsVector,
    /// Observation Jacobian H = ∂h/∂x.
    pub jacobian: ObsJacobian,
    /// Adaptive observation noise R.
    pub noise: ObsCovariance,
}

/// Build the correction artifacts around the predicted state.
///
/// `mag` carries the latest reading (µT) and its norm when one is pending;
/// with no fresh reading the magnetic block is zeroed and its noise pinned
/// to 1 so the innovation covariance stays invertible.
#[allow(clippy::too_many_arguments)]
pub fn observation_step(
    x_prior: &StateVector,
    accel: &Vector3<Scalar>,
    accel_norm: Scalar,
    rate_norm: Scalar,
    mag: Option<(Vector3<Scalar>, Scalar)>,
    conditioner: &mut MagConditioner,
    config: &EstimatorConfig,
    in_startup: bool,
) -> ObservationStep {
    let (q0, q1, q2, q3) = (x_prior[0], x_prior[1], x_prior[2], x_prior[3]);
    let g = GRAVITY;

    // Third column of the body-to-world DCM: estimated up direction.
    let vertical = Vector3::new(
        2.0 * (q1 * q3 - q0 * q2),
        2.0 * (q2 * q3 + q0 * q1),
        q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3,
    );

    let mut z = ObsVector::zeros();
    let mut predicted = ObsVector::zeros();
    let mut jacobian = ObsJacobian::zeros();

    // Gravity block.
    z[0] = accel.x;
    z[1] = accel.y;
    z[2] = accel.z;
    predicted[0] = vertical.x * g;
    predicted[1] = vertical.y * g;
    predicted[2] = vertical.z * g;

    jacobian
        .fixed_view_mut::<1, 4>(0, 0)
        .copy_from_slice(&[-2.0 * g * q2, 2.0 * g * q3, -2.0 * g * q0, 2.0 * g * q1]);
    jacobian
        .fixed_view_mut::<1, 4>(1, 0)
        .copy_from_slice(&[2.0 * g * q1, 2.0 * g * q0, 2.0 * g * q3, 2.0 * g * q2]);
    jacobian
        .fixed_view_mut::<1, 4>(2, 0)
        .copy_from_slice(&[2.0 * g * q0, -2.0 * g * q1, -2.0 * g * q2, 2.0 * g * q3]);

    let r_g = config.r_g_0 + config.r_g_w * rate_norm + config.r_g_g * fabs(g - accel_norm);

    // Magnetic block, only when a fresh reading is pending.
    let r_y = if let Some((field, field_norm)) = mag {
        let terms = conditioner.condition(&field, field_norm, &vertical);

        z[3] = terms.horizontal.x;
        z[4] = terms.horizontal.y;
        z[5] = terms.horizontal.z;
        // Second column of the DCM: magnetic north at the predicted state.
        predicted[3] = 2.0 * (q1 * q2 + q0 * q3);
        predicted[4] = q0 * q0 - q1 * q1 + q2 * q2 - q3 * q3;
        predicted[5] = 2.0 * (q2 * q3 - q0 * q1);

        jacobian
            .fixed_view_mut::<1, 4>(3, 0)
            .copy_from_slice(&[2.0 * q3, 2.0 * q2, 2.0 * q1, 2.0 * q0]);
        jacobian
            .fixed_view_mut::<1, 4>(4, 0)
            .copy_from_slice(&[2.0 * q0, -2.0 * q1, 2.0 * q2, -2.0 * q3]);
        jacobian
            .fixed_view_mut::<1, 4>(5, 0)
            .copy_from_slice(&[-2.0 * q1, -2.0 * q0, 2.0 * q3, 2.0 * q2]);

        config.r_y_0
            + config.r_y_w * rate_norm
            + config.r_y_g * fabs(g - accel_norm)
            + config.r_y_n * terms.norm_dev
            + config.r_y_d * terms.dip_dev
    } else {
        // Value is irrelevant while the rows are zero; it only has to keep
        // S⁻¹ finite.
        1.0
    };

    let mut noise = ObsCovariance::zeros();
    let (r_acc, r_mag) = if in_startup {
        (config.r_g_startup, config.r_y_startup)
    } else {
        (r_g, r_y)
    };
    for i in 0..3 {
        noise[(i, i)] = r_acc;
        noise[(i + 3, i + 3)] = r_mag;
    }

    ObservationStep {
        z,
        predicted,
        jacobian,
        noise,
    }
}
