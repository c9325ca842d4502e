//! Replay driver: feed a sample list through the estimator and collect
//! every published rotation.

use aster_core::{AxisAngle, Estimator};

use crate::streams::SensorSample;

const NANOS_PER_SEC: f64 = 1e9;

/// Publish log of one replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    /// Sample time of each publish (s).
    pub time_s: Vec<f64>,
    /// Rotation emitted at that time.
    pub rotations: Vec<AxisAngle>,
}

impl ReplayResult {
    pub fn len(&self) -> usize {
        self.rotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    pub fn final_rotation(&self) -> Option<AxisAngle> {
        self.rotations.last().copied()
    }
}

/// Push every sample into the estimator in list order.
pub fn run_replay(estimator: &mut Estimator, samples: &[SensorSample]) -> ReplayResult {
    let mut result = ReplayResult::default();

    for sample in samples {
        let published = match *sample {
            SensorSample::Gyro {
                timestamp_ns,
                rate_deg_s,
            } => estimator.on_gyro(timestamp_ns, rate_deg_s.x, rate_deg_s.y, rate_deg_s.z),
            SensorSample::Accel {
                timestamp_ns,
                accel_mps2,
            } => estimator.on_accel(timestamp_ns, accel_mps2.x, accel_mps2.y, accel_mps2.z),
            SensorSample::Mag {
                timestamp_ns,
                field_t,
            } => {
                estimator.on_mag(timestamp_ns, field_t.x, field_t.y, field_t.z);
                None
            }
        };

        if let Some(rotation) = published {
            result.time_s.push(sample.timestamp_ns() as f64 / NANOS_PER_SEC);
            result.rotations.push(rotation);
        }
    }

    result
}

// ===========================================================================
// TESTS (end-to-end scenarios)
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{generate_samples, ScenarioConfig};
    use approx::assert_abs_diff_eq;
    use aster_core::GRAVITY;
    use nalgebra::Vector3;

    fn level_no_mag() -> ScenarioConfig {
        ScenarioConfig {
            mag_hz: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn static_level_settles_at_zero_rotation() {
        let cfg = level_no_mag();
        let mut est = Estimator::default();
        let result = run_replay(&mut est, &generate_samples(&cfg));

        assert!(!result.is_empty(), "startup must end within the scenario");
        let rot = result.final_rotation().unwrap();
        assert!(rot.angle_deg.abs() < 0.5, "angle was {}", rot.angle_deg);
        assert!(rot.axis.norm() < 0.01);
    }

    #[test]
    fn pure_yaw_integrates_to_ninety_degrees() {
        // One quiet second to get through startup, then 90 °/s about z
        // for one second.
        let quiet = ScenarioConfig {
            duration_s: 1.05,
            ..level_no_mag()
        };
        let spin = ScenarioConfig {
            start_s: 1.05,
            duration_s: 1.0,
            gyro_deg_s: Vector3::new(0.0, 0.0, 90.0),
            ..level_no_mag()
        };
        let mut samples = generate_samples(&quiet);
        samples.extend(generate_samples(&spin));

        let mut est = Estimator::default();
        let result = run_replay(&mut est, &samples);

        let rot = result.final_rotation().unwrap();
        assert_abs_diff_eq!(rot.angle_deg, 90.0, epsilon = 3.0);
        let axis_dir = rot.axis.normalize();
        assert!(axis_dir.z.abs() > 0.99, "axis was {:?}", rot.axis);

        // Sign continuity: the published angle never jumps between
        // consecutive emissions.
        for pair in result.rotations.windows(2) {
            assert!((pair[1].angle_deg - pair[0].angle_deg).abs() < 5.0);
        }
    }

    #[test]
    fn tilt_recovery_realigns_gravity() {
        // Device tilted 90° about y: gravity reads along +x.
        let cfg = ScenarioConfig {
            duration_s: 4.0,
            accel_mps2: Vector3::new(GRAVITY, 0.0, 0.0),
            ..level_no_mag()
        };
        let mut est = Estimator::default();
        let result = run_replay(&mut est, &generate_samples(&cfg));
        assert!(!result.is_empty());

        // The posterior must predict the measured gravity: the third DCM
        // column converges to +x.
        let q = est.posterior_quaternion();
        let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
        let vertical = Vector3::new(
            2.0 * (q1 * q3 - q0 * q2),
            2.0 * (q2 * q3 + q0 * q1),
            q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3,
        );
        assert_abs_diff_eq!(vertical.x, 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(vertical.y, 0.0, epsilon = 0.05);
        assert_abs_diff_eq!(vertical.z, 0.0, epsilon = 0.05);

        // Which is a quarter turn about ±y.
        let rot = result.final_rotation().unwrap();
        assert_abs_diff_eq!(rot.angle_deg, 90.0, epsilon = 5.0);
        assert!(rot.axis.normalize().y.abs() > 0.99);
    }

    #[test]
    fn horizontal_mag_swings_heading_into_alignment() {
        // Level device, field pointing along +x while the identity state
        // predicts magnetic north along +y: the filter must yaw 90°.
        let cfg = ScenarioConfig {
            duration_s: 4.0,
            mag_ut: Vector3::new(1.0, 0.0, 0.0),
            ..Default::default()
        };
        let mut est = Estimator::default();
        let result = run_replay(&mut est, &generate_samples(&cfg));

        let rot = result.final_rotation().unwrap();
        assert_abs_diff_eq!(rot.angle_deg, 90.0, epsilon = 5.0);
        assert!(rot.axis.normalize().z.abs() > 0.99, "axis was {:?}", rot.axis);
    }

    #[test]
    fn losing_the_accelerometer_degrades_but_keeps_publishing() {
        let warmup = ScenarioConfig {
            duration_s: 0.2,
            ..level_no_mag()
        };
        let gyro_only = ScenarioConfig {
            start_s: 0.2,
            duration_s: 12.0,
            accel_hz: 0.0,
            ..level_no_mag()
        };
        let mut samples = generate_samples(&warmup);
        samples.extend(generate_samples(&gyro_only));

        let mut est = Estimator::default();
        let result = run_replay(&mut est, &samples);

        // The accel stream was seen once, so its silence is counted; past
        // 1000 cycles the estimator warns but keeps running on gyro alone.
        assert!(est.accel_silent_cycles() > 1000);
        assert!(result.len() > 1000);
        assert!(*result.time_s.last().unwrap() > 12.0);
    }

    #[test]
    fn duplicated_gyro_timestamp_changes_nothing() {
        let cfg = ScenarioConfig {
            duration_s: 2.0,
            gyro_deg_s: Vector3::new(10.0, 0.0, 45.0),
            ..level_no_mag()
        };
        let samples = generate_samples(&cfg);

        let mut with_dup = samples.clone();
        let gyro_idx = with_dup
            .iter()
            .rposition(|s| matches!(s, SensorSample::Gyro { .. }))
            .unwrap();
        let dup = with_dup[gyro_idx];
        with_dup.insert(gyro_idx + 1, dup);

        let mut reference = Estimator::default();
        run_replay(&mut reference, &samples);
        let mut duplicated = Estimator::default();
        run_replay(&mut duplicated, &with_dup);

        assert_eq!(
            reference.posterior_quaternion(),
            duplicated.posterior_quaternion()
        );
    }
}
