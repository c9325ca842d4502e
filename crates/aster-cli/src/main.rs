//! Aster CLI - replay synthetic IMU streams through the orientation
//! estimator and export the published rotations.

use anyhow::Result;
use aster_core::{Estimator, EstimatorConfig, GRAVITY};
use aster_sim::{generate_samples, run_replay, ReplayResult, ScenarioConfig, SensorSample};
use clap::{Parser, ValueEnum};
use nalgebra::Vector3;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "aster")]
#[command(about = "IMU orientation estimator replay harness")]
#[command(version)]
struct Args {
    /// Scenario to replay
    #[arg(short, long, value_enum, default_value = "static-level")]
    scenario: Scenario,

    /// Output directory
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Output file format
    #[arg(short, long, value_enum, default_value = "csv")]
    format: OutputFormat,

    // ── Stream parameters ─────────────────────────────────────
    #[arg(long, default_value_t = 3.0)]
    duration: f64,

    #[arg(long, default_value_t = 100.0)]
    gyro_hz: f64,

    #[arg(long, default_value_t = 100.0)]
    accel_hz: f64,

    #[arg(long, default_value_t = 20.0)]
    mag_hz: f64,

    #[arg(long, default_value_t = 0.0)]
    gyro_noise_std: f64, // deg/s

    #[arg(long, default_value_t = 0.0)]
    accel_noise_std: f64, // m/s^2

    #[arg(long, default_value_t = 0.0)]
    mag_noise_std: f64, // µT

    #[arg(long, default_value_t = 1.0)]
    noise_scale: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    // ── Estimator tuning ──────────────────────────────────────
    #[arg(long, default_value_t = 1.0)]
    startup_seconds: f64,

    #[arg(long, default_value_t = 1.0)]
    r_g_0: f64,

    #[arg(long, default_value_t = 10.0)]
    r_y_0: f64,

    #[arg(long, default_value_t = 1e-4)]
    q_diag: f64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Level and at rest, gyro + accel only
    StaticLevel,
    /// One quiet second, then 90 °/s about z for one second
    Yaw,
    /// Gravity along +x: recovery from a 90° tilt about y
    Tilt,
    /// Level with a horizontal field along +x: heading alignment
    MagStep,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    println!("Aster IMU Orientation Estimator");
    println!("===============================\n");

    let samples = build_scenario(&args);
    let mut estimator = Estimator::new(build_config(&args));
    let result = run_replay(&mut estimator, &samples);

    print_stats(&samples, &estimator, &result);
    write_output(&args, &estimator, &result)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Scenario assembly
// ---------------------------------------------------------------------------

fn base_segment(args: &Args) -> ScenarioConfig {
    ScenarioConfig {
        start_s: 0.0,
        duration_s: args.duration,
        gyro_hz: args.gyro_hz,
        accel_hz: args.accel_hz,
        mag_hz: args.mag_hz,
        gyro_deg_s: Vector3::zeros(),
        accel_mps2: Vector3::new(0.0, 0.0, GRAVITY),
        mag_ut: Vector3::new(0.0, 20.0, 0.0),
        gyro_noise_std: args.gyro_noise_std,
        accel_noise_std: args.accel_noise_std,
        mag_noise_std: args.mag_noise_std,
        noise_scale: args.noise_scale,
        seed: args.seed,
    }
}

fn build_scenario(args: &Args) -> Vec<SensorSample> {
    match args.scenario {
        Scenario::StaticLevel => generate_samples(&ScenarioConfig {
            mag_hz: 0.0,
            ..base_segment(args)
        }),
        Scenario::Yaw => {
            let quiet = ScenarioConfig {
                duration_s: args.startup_seconds + 0.05,
                mag_hz: 0.0,
                ..base_segment(args)
            };
            let spin = ScenarioConfig {
                start_s: quiet.duration_s,
                duration_s: 1.0,
                gyro_deg_s: Vector3::new(0.0, 0.0, 90.0),
                mag_hz: 0.0,
                ..base_segment(args)
            };
            let mut samples = generate_samples(&quiet);
            samples.extend(generate_samples(&spin));
            samples
        }
        Scenario::Tilt => generate_samples(&ScenarioConfig {
            accel_mps2: Vector3::new(GRAVITY, 0.0, 0.0),
            mag_hz: 0.0,
            ..base_segment(args)
        }),
        Scenario::MagStep => generate_samples(&ScenarioConfig {
            mag_ut: Vector3::new(1.0, 0.0, 0.0),
            ..base_segment(args)
        }),
    }
}

fn build_config(args: &Args) -> EstimatorConfig {
    EstimatorConfig {
        startup_seconds: args.startup_seconds,
        r_g_0: args.r_g_0,
        r_y_0: args.r_y_0,
        q_diag: args.q_diag,
        ..EstimatorConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn print_stats(samples: &[SensorSample], estimator: &Estimator, result: &ReplayResult) {
    let axis = estimator.rotation_axis();
    println!("\nReplay Stats:");
    println!("  Samples:     {}", samples.len());
    println!("  Publishes:   {}", result.len());
    println!("  Angle:       {:.3}°", estimator.rotation_angle());
    println!(
        "  Axis:        ({:.4}, {:.4}, {:.4})",
        axis.x, axis.y, axis.z
    );
    println!(
        "  Silent gyro/accel/mag: {}/{}/{}",
        estimator.gyro_silent_cycles(),
        estimator.accel_silent_cycles(),
        estimator.mag_silent_cycles()
    );
    println!("-----------------------------");
}

fn write_output(args: &Args, estimator: &Estimator, result: &ReplayResult) -> Result<()> {
    std::fs::create_dir_all(&args.output_dir)?;

    let path = args.output_dir.join("rotation.csv");
    let mut wtr = csv::Writer::from_path(&path)?;
    wtr.write_record(["time", "angle_deg", "axis_x", "axis_y", "axis_z"])?;
    for (t, rot) in result.time_s.iter().zip(&result.rotations) {
        wtr.write_record(&[
            format!("{:.6}", t),
            format!("{:.6}", rot.angle_deg),
            format!("{:.6}", rot.axis.x),
            format!("{:.6}", rot.axis.y),
            format!("{:.6}", rot.axis.z),
        ])?;
    }
    wtr.flush()?;
    println!("Rotations written to {:?}", path);

    if matches!(args.format, OutputFormat::Json) {
        let q = estimator.posterior_quaternion();
        let axis = estimator.rotation_axis();
        let summary = serde_json::json!({
            "scenario": format!("{:?}", args.scenario),
            "publishes": result.len(),
            "final_angle_deg": estimator.rotation_angle(),
            "final_axis": [axis.x, axis.y, axis.z],
            "final_quaternion": [q[0], q[1], q[2], q[3]],
            "silent_cycles": {
                "gyro": estimator.gyro_silent_cycles(),
                "accel": estimator.accel_silent_cycles(),
                "mag": estimator.mag_silent_cycles(),
            },
        });
        let summary_path = args.output_dir.join("summary.json");
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
        println!("Summary written to {:?}", summary_path);
    }

    Ok(())
}
