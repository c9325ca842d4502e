//! Synthetic sensor-stream generation.
//!
//! Each stream runs at its own rate with its own timestamps; the merged
//! sample list is what a platform sensor layer would deliver. Inputs are
//! constant over a scenario segment, so phased maneuvers are built by
//! concatenating segments with staggered `start_s`.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const NANOS_PER_SEC: f64 = 1e9;
const MICROTESLA_TO_TESLA: f64 = 1e-6;

/// One timestamped reading, in the units the estimator ingests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorSample {
    /// Angular velocity in deg/s.
    Gyro { timestamp_ns: u64, rate_deg_s: Vector3<f64> },
    /// Linear acceleration in m/s².
    Accel { timestamp_ns: u64, accel_mps2: Vector3<f64> },
    /// Magnetic field in Tesla.
    Mag { timestamp_ns: u64, field_t: Vector3<f64> },
}

impl SensorSample {
    pub fn timestamp_ns(&self) -> u64 {
        match *self {
            Self::Gyro { timestamp_ns, .. }
            | Self::Accel { timestamp_ns, .. }
            | Self::Mag { timestamp_ns, .. } => timestamp_ns,
        }
    }

    /// Tie-break rank for equal timestamps: predict before correct,
    /// stash last.
    fn order(&self) -> u8 {
        match self {
            Self::Gyro { .. } => 0,
            Self::Accel { .. } => 1,
            Self::Mag { .. } => 2,
        }
    }
}

/// Constant-input scenario segment. A rate of 0 Hz disables a stream.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioConfig {
    /// Segment start time (s); lets segments be concatenated.
    pub start_s: f64,
    /// Segment length (s).
    pub duration_s: f64,

    pub gyro_hz: f64,
    pub accel_hz: f64,
    pub mag_hz: f64,

    /// Angular velocity input, deg/s.
    pub gyro_deg_s: Vector3<f64>,
    /// Acceleration input, m/s².
    pub accel_mps2: Vector3<f64>,
    /// Magnetic field input, µT.
    pub mag_ut: Vector3<f64>,

    /// Per-axis Gaussian noise sigmas.
    pub gyro_noise_std: f64,
    pub accel_noise_std: f64,
    pub mag_noise_std: f64,
    /// Common multiplier over the three sigmas.
    pub noise_scale: f64,

    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            start_s: 0.0,
            duration_s: 3.0,
            gyro_hz: 100.0,
            accel_hz: 100.0,
            mag_hz: 20.0,
            gyro_deg_s: Vector3::zeros(),
            accel_mps2: Vector3::new(0.0, 0.0, 9.81),
            mag_ut: Vector3::new(0.0, 20.0, 0.0),
            gyro_noise_std: 0.0,
            accel_noise_std: 0.0,
            mag_noise_std: 0.0,
            noise_scale: 1.0,
            seed: 42,
        }
    }
}

/// Generate the merged, time-ordered sample list for one segment.
pub fn generate_samples(cfg: &ScenarioConfig) -> Vec<SensorSample> {
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let d_gyro = Normal::new(0.0, cfg.noise_scale * cfg.gyro_noise_std).unwrap();
    let d_accel = Normal::new(0.0, cfg.noise_scale * cfg.accel_noise_std).unwrap();
    let d_mag = Normal::new(0.0, cfg.noise_scale * cfg.mag_noise_std).unwrap();

    let mut samples = Vec::new();

    for t_ns in stream_times(cfg.start_s, cfg.duration_s, cfg.gyro_hz) {
        let rate = cfg.gyro_deg_s + noise_vector(&d_gyro, &mut rng);
        samples.push(SensorSample::Gyro {
            timestamp_ns: t_ns,
            rate_deg_s: rate,
        });
    }
    for t_ns in stream_times(cfg.start_s, cfg.duration_s, cfg.accel_hz) {
        let accel = cfg.accel_mps2 + noise_vector(&d_accel, &mut rng);
        samples.push(SensorSample::Accel {
            timestamp_ns: t_ns,
            accel_mps2: accel,
        });
    }
    for t_ns in stream_times(cfg.start_s, cfg.duration_s, cfg.mag_hz) {
        let field_ut = cfg.mag_ut + noise_vector(&d_mag, &mut rng);
        samples.push(SensorSample::Mag {
            timestamp_ns: t_ns,
            field_t: field_ut * MICROTESLA_TO_TESLA,
        });
    }

    samples.sort_by_key(|s| (s.timestamp_ns(), s.order()));
    samples
}

fn stream_times(start_s: f64, duration_s: f64, hz: f64) -> Vec<u64> {
    if hz <= 0.0 {
        return Vec::new();
    }
    let count = (duration_s * hz).floor() as u64;
    (0..count)
        .map(|i| ((start_s + i as f64 / hz) * NANOS_PER_SEC) as u64)
        .collect()
}

fn noise_vector(dist: &Normal<f64>, rng: &mut StdRng) -> Vector3<f64> {
    Vector3::new(dist.sample(rng), dist.sample(rng), dist.sample(rng))
}
