use anyhow::Result;
use clap::Parser;
use sensorlink_config::AppConfig;
use sensorlink_imu::calibration::SensorKind;
use sensorlink_imu::hub::{SensorHub, SensorSnapshot};
use sensorlink_imu::types::WireFormat;
use sensorlink_imu::SensorServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sensorlink", about = "Receive phone IMU telemetry over TCP")]
struct Args {
    /// Config file (defaults to the per-user config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the wire format (binary24, binary28, binary36, csv3, csv6).
    #[arg(short, long)]
    format: Option<WireFormat>,

    /// Override the bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Write the effective config back to disk before starting.
    #[arg(long)]
    save_config: bool,
}

/// Operator commands read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    StartServer,
    StopServer,
    Begin(SensorKind),
    Start(SensorKind),
    Stop(SensorKind),
    ResetRotation,
    LockToReference,
    ResetMotion,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let kind = |word: &str| match word {
        "gyro" | "g" => Some(SensorKind::Gyro),
        "accel" | "a" => Some(SensorKind::Accel),
        _ => None,
    };

    match words.as_slice() {
        ["serve"] | ["listen"] => Some(Command::StartServer),
        ["halt"] | ["unlisten"] => Some(Command::StopServer),
        // Bare start/stop drive the gyro run.
        ["start"] => Some(Command::Start(SensorKind::Gyro)),
        ["stop"] => Some(Command::Stop(SensorKind::Gyro)),
        [k, "begin"] => kind(k).map(Command::Begin),
        [k, "start"] => kind(k).map(Command::Start),
        [k, "stop"] => kind(k).map(Command::Stop),
        ["reset"] => Some(Command::ResetRotation),
        ["lock"] => Some(Command::LockToReference),
        ["zero"] => Some(Command::ResetMotion),
        ["status"] | ["s"] => Some(Command::Status),
        ["help"] | ["?"] => Some(Command::Help),
        ["quit"] | ["exit"] | ["q"] => Some(Command::Quit),
        _ => None,
    }
}

const HELP: &str = "\
commands:
  serve | halt                 start or stop the TCP server
  gyro|accel begin|start|stop  drive a calibration run (bare start/stop = gyro)
  reset                        rotation back to identity
  lock                         rotation to the reference alignment
  zero                         clear velocity and position
  status                       print the current snapshot
  quit";

fn print_status(snap: &SensorSnapshot) {
    let euler = snap.orientation.rotation.to_euler(glam::EulerRot::YXZ);
    println!(
        "rotation (deg) yaw={:.1} pitch={:.1} roll={:.1}",
        euler.0.to_degrees(),
        euler.1.to_degrees(),
        euler.2.to_degrees()
    );
    println!(
        "velocity={:?} position={:?}",
        snap.orientation.velocity, snap.orientation.position
    );
    match snap.frequency_hz {
        Some(hz) => println!("frequency={hz:.1} Hz"),
        None => println!("frequency=n/a"),
    }
    println!(
        "sessions={} routed={:?} accepted={} rejected={}",
        snap.active_sessions, snap.routed_session, snap.frames_accepted, snap.frames_rejected
    );
    for view in [&snap.gyro_calibration, &snap.accel_calibration] {
        println!(
            "{:?} calibration: {:?} \"{}\" scale={:?}",
            view.kind, view.phase, view.prompt, view.scale_factors
        );
    }
    if let Some(warning) = &snap.last_warning {
        println!("last warning: {warning}");
    }
}

async fn execute(command: Command, server: &mut SensorServer) {
    let hub = Arc::clone(server.hub());
    match command {
        Command::StartServer => match server.start_server().await {
            Ok(addr) => info!(%addr, "Server started"),
            Err(e) => error!(%e, "Server failed to start"),
        },
        Command::StopServer => server.stop_server().await,
        Command::Begin(kind) => {
            if !hub.begin_calibration(kind) {
                warn!(?kind, "Calibration already in progress");
            }
        }
        Command::Start(kind) => {
            if !hub.start_calibration(kind) {
                warn!(?kind, "Start ignored: calibration is not waiting for start");
            }
        }
        Command::Stop(kind) => match hub.stop_calibration(kind) {
            Ok(result) => info!(
                ?kind,
                axis = result.axis,
                captured = result.captured,
                scale = result.scale,
                "Axis calibrated"
            ),
            Err(e) => warn!(?kind, %e, "Stop rejected"),
        },
        Command::ResetRotation => hub.reset_rotation(),
        Command::LockToReference => hub.lock_to_reference(),
        Command::ResetMotion => hub.reset_motion(),
        Command::Status => print_status(&hub.snapshot()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

/// Advance the integrator at the display rate with the measured delta.
fn spawn_ticker(hub: Arc<SensorHub>, config: &AppConfig) -> tokio::task::JoinHandle<()> {
    let period = config.tick_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();
        loop {
            interval.tick().await;
            let now = Instant::now();
            hub.tick(now.duration_since(last).as_secs_f32());
            last = now;
        }
    })
}

/// Log calibration prompts as they change.
fn spawn_prompt_logger(hub: &SensorHub) -> tokio::task::JoinHandle<()> {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        let mut last = {
            let snap = rx.borrow();
            (snap.gyro_calibration.prompt.clone(), snap.accel_calibration.prompt.clone())
        };
        while rx.changed().await.is_ok() {
            let current = {
                let snap = rx.borrow_and_update();
                (snap.gyro_calibration.prompt.clone(), snap.accel_calibration.prompt.clone())
            };
            if current.0 != last.0 && !current.0.is_empty() {
                info!(prompt = %current.0, "Gyro calibration");
            }
            if current.1 != last.1 && !current.1.is_empty() {
                info!(prompt = %current.1, "Accel calibration");
            }
            last = current;
        }
    })
}

fn load(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => sensorlink_config::load_config_from(path)?,
        None => sensorlink_config::load_config().unwrap_or_else(|e| {
            warn!(?e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(format) = args.format {
        config.server.wire_format = format;
    }
    if let Some(bind) = &args.bind {
        config.server.bind_address = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensorlink=info,sensorlink_imu=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("sensorlink starting");

    let config = load(&args)?;
    info!(
        port = config.server.port,
        format = ?config.server.wire_format,
        policy = ?config.integration.policy,
        "Config loaded"
    );
    if args.save_config {
        sensorlink_config::save_config(&config)?;
    }

    let hub = Arc::new(SensorHub::new(config.hub_settings()));
    let mut server = SensorServer::new(config.server_settings(), Arc::clone(&hub));
    let addr = server.start_server().await?;
    info!(%addr, "Waiting for sensor connections (type 'help' for commands)");

    let ticker = spawn_ticker(Arc::clone(&hub), &config);
    let prompts = spawn_prompt_logger(&hub);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            // stdin closed: keep serving until interrupted.
            Ok(None) => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(%e, "Failed to wait for ctrl-c");
                }
                break;
            }
            Err(e) => {
                error!(%e, "Console read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(Command::Quit) => break,
            Some(command) => execute(command, &mut server).await,
            None => println!("unknown command '{}', try 'help'", line.trim()),
        }
    }

    server.stop_server().await;
    ticker.abort();
    prompts.abort();
    info!("sensorlink stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_calibration_commands() {
        assert_eq!(
            parse_command("gyro begin"),
            Some(Command::Begin(SensorKind::Gyro))
        );
        assert_eq!(
            parse_command("  accel   stop "),
            Some(Command::Stop(SensorKind::Accel))
        );
        assert_eq!(parse_command("start"), Some(Command::Start(SensorKind::Gyro)));
        assert_eq!(parse_command("mag start"), None);
    }

    #[test]
    fn parses_controls() {
        assert_eq!(parse_command("lock"), Some(Command::LockToReference));
        assert_eq!(parse_command("zero"), Some(Command::ResetMotion));
        assert_eq!(parse_command("serve"), Some(Command::StartServer));
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "sensorlink",
            "--config",
            "/nonexistent/sensorlink.toml",
            "--port",
            "4000",
            "--format",
            "csv3",
        ]);
        let config = load(&args).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.wire_format, WireFormat::TextCsv3);
    }
}
