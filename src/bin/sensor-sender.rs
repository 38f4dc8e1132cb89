//! Stand-in for the phone app: streams synthetic frames to a sensorlink server.

use anyhow::{Context, Result};
use clap::Parser;
use glam::Vec3;
use sensorlink_imu::fusion::quat_from_euler_degrees;
use sensorlink_imu::protocol::encode_frame;
use sensorlink_imu::types::{SensorFrame, WireFormat};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sensor-sender", about = "Send synthetic IMU frames over TCP")]
struct Args {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:1234")]
    addr: String,

    /// Wire format (binary24, binary28, binary36, csv3, csv6).
    #[arg(short, long, default_value = "binary24")]
    format: WireFormat,

    /// Frames per second.
    #[arg(short, long, default_value_t = 100.0)]
    rate_hz: f64,

    /// Stop after this many seconds (runs until interrupted if omitted).
    #[arg(short, long)]
    duration: Option<f64>,

    /// Acceleration to report, `x,y,z`.
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [0.0, 0.0, 9.81]
    )]
    accel: Vec<f32>,

    /// Gyro increment to report per frame in degrees, `x,y,z`.
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [0.0, 0.5, 0.0]
    )]
    gyro: Vec<f32>,

    /// Magnetometer reading for binary36, `x,y,z`.
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_values_t = [20.0, 0.0, -40.0]
    )]
    mag: Vec<f32>,
}

fn vec3(name: &str, values: &[f32]) -> Result<Vec3> {
    match values {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => anyhow::bail!("--{name} takes exactly three values, got {}", values.len()),
    }
}

/// Frame number `n` of a steady rotation at `gyro` per frame.
fn synth_frame(format: WireFormat, n: u64, accel: Vec3, gyro: Vec3, mag: Vec3) -> SensorFrame {
    match format {
        WireFormat::Binary24 => SensorFrame::SixAxis { accel, gyro },
        WireFormat::Binary28 => SensorFrame::SevenField {
            accel,
            quat: quat_from_euler_degrees(gyro * n as f32).normalize(),
        },
        WireFormat::Binary36 => SensorFrame::NineAxis { accel, gyro, mag },
        WireFormat::TextCsv3 => SensorFrame::TextTriple { accel },
        WireFormat::TextCsv6 => SensorFrame::TextSix { accel, gyro },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_sender=info".into()),
        )
        .init();

    let args = Args::parse();
    if !(args.rate_hz.is_finite() && args.rate_hz > 0.0) {
        anyhow::bail!("--rate-hz must be positive");
    }
    let accel = vec3("accel", &args.accel)?;
    let gyro = vec3("gyro", &args.gyro)?;
    let mag = vec3("mag", &args.mag)?;

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?;
    stream.set_nodelay(true)?;
    info!(addr = %args.addr, format = ?args.format, rate_hz = args.rate_hz, "Connected");

    let limit = args
        .duration
        .map(|secs| (secs * args.rate_hz).round().max(0.0) as u64);

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate_hz));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sent = 0u64;
    loop {
        if limit.is_some_and(|limit| sent >= limit) {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let frame = synth_frame(args.format, sent, accel, gyro, mag);
        stream
            .write_all(&encode_frame(args.format, &frame))
            .await
            .context("server closed the connection")?;
        sent += 1;
    }

    stream.shutdown().await?;
    info!(frames = sent, "Done");
    Ok(())
}
