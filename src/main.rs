use std::{
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use repcoach::{
    ArmSide, CalibrationPhase, CanvasSurface, Coach, CoachConfig, CoachError, LoopbackTransport,
    Mode, SyntheticCamera, TcpTransport, Transport,
    config::DEFAULT_SERVER_ADDR,
    service::{AnalysisServer, AngleSource, SimulatedAthlete},
    writer,
};

/// Upper bound on how long the driver sleeps between two `advance` calls, so
/// transport events are picked up promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const LOOPBACK_LATENCY: Duration = Duration::from_millis(15);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Arm {
    Left,
    Right,
}

impl From<Arm> for ArmSide {
    fn from(arm: Arm) -> Self {
        match arm {
            Arm::Left => ArmSide::Left,
            Arm::Right => ArmSide::Right,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a headless session: MIN and MAX calibration, then training
    Run {
        /// Analysis service address, the built-in simulated service is used
        /// when omitted
        #[arg(short, long)]
        addr: Option<String>,

        #[arg(long, value_enum, default_value_t = Arm::Left)]
        arm: Arm,

        #[arg(short, long, default_value_t = 20)]
        train_seconds: u64,

        /// Writes the last rendered frame as a PNG file
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Writes the session events as JSON lines
        #[arg(short, long)]
        events: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Serves the simulated analysis service over TCP
    Serve {
        #[arg(short, long, default_value = DEFAULT_SERVER_ADDR)]
        addr: String,
    },
    /// Writes the default configuration, to the user's config directory
    /// unless a path is given
    InitConfig {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

struct RunOptions {
    arm: ArmSide,
    train_seconds: u64,
    snapshot: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<CoachConfig, CoachError> {
    match path {
        Some(path) => CoachConfig::from_file(path),
        None => Ok(CoachConfig::from_local_file()?.unwrap_or_default()),
    }
}

/// Advances the coach in real time until `done` holds or `limit` elapsed.
fn run_until<T: Transport>(
    coach: &mut Coach<T, CanvasSurface>,
    limit: Duration,
    done: impl Fn(&Coach<T, CanvasSurface>) -> bool,
) -> bool {
    let end = Instant::now() + limit;
    loop {
        let now = Instant::now();
        coach.advance(now);
        for notice in coach.take_notices() {
            warn!("{}", notice.message);
        }
        if done(coach) {
            return true;
        }
        if now >= end {
            return false;
        }
        let wake = coach
            .next_deadline()
            .unwrap_or(end)
            .min(end)
            .min(now + POLL_INTERVAL);
        thread::sleep(wake.saturating_duration_since(Instant::now()));
    }
}

fn drive<T: Transport>(
    mut coach: Coach<T, CanvasSurface>,
    options: RunOptions,
) -> Result<(), CoachError> {
    coach.get_started()?;
    coach.select_arm(options.arm)?;
    coach.start_camera(Instant::now())?;
    info!("Tracking {}", coach.session().arm_side());

    let config = coach.config().clone();
    let phase_limit =
        config.countdown_unit() * (config.countdown_units + 2) + config.settle_delay();
    for phase in [CalibrationPhase::Min, CalibrationPhase::Max] {
        info!("{phase} calibration: {}", phase.instruction());
        match phase {
            CalibrationPhase::Min => coach.calibrate_min(Instant::now())?,
            CalibrationPhase::Max => coach.calibrate_max(Instant::now())?,
        }
        let settled = run_until(&mut coach, phase_limit, |coach| {
            coach.session().mode() == Mode::Armed
        });
        if !settled {
            warn!("{phase} calibration did not finish in time");
        }
    }

    coach.complete_calibration(Instant::now())?;
    if let Some(range) = coach.session().angle_range() {
        info!("Calibrated range {range}");
    }

    run_until(
        &mut coach,
        Duration::from_secs(options.train_seconds),
        |coach| coach.session().mode() != Mode::Training,
    );
    println!(
        "Reps: {} ({}% into the current rep)",
        coach.session().rep_count(),
        coach.session().progress_percentage()
    );

    if let Some(path) = options.snapshot {
        coach.surface().save_png(&path)?;
        info!("Snapshot written to {}", path.display());
    }
    coach.go_home(&mut |_: &str| true);
    Ok(())
}

fn run(
    addr: Option<String>,
    config_path: Option<PathBuf>,
    events: Option<PathBuf>,
    options: RunOptions,
) -> Result<(), CoachError> {
    let config = load_config(config_path.as_deref())?;

    let (event_sender, event_writer) = match events {
        Some(path) => {
            let (tx, rx) = mpsc::channel();
            let handle = thread::spawn(move || writer::write_session_events(&path, rx));
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    let camera = Box::new(SyntheticCamera::test_pattern());
    let result = match addr {
        Some(addr) => {
            let transport = TcpTransport::connect(&addr, config.reconnect_wait())?;
            let mut coach = Coach::new(config, camera, transport, CanvasSurface::new());
            if let Some(sender) = event_sender {
                coach = coach.with_event_log(sender);
            }
            drive(coach, options)
        }
        None => {
            let transport = LoopbackTransport::new(Box::new(SimulatedAthlete::default()))
                .with_latency(LOOPBACK_LATENCY);
            let mut coach = Coach::new(config, camera, transport, CanvasSurface::new());
            if let Some(sender) = event_sender {
                coach = coach.with_event_log(sender);
            }
            drive(coach, options)
        }
    };

    if let Some(handle) = event_writer {
        match handle.join() {
            Ok(written) => written?,
            Err(_) => error!("Session event writer panicked"),
        }
    }
    result
}

fn serve(addr: &str) -> Result<(), CoachError> {
    AnalysisServer::bind(addr)?.run(|| -> Box<dyn AngleSource + Send> {
        Box::new(SimulatedAthlete::default())
    })
}

fn init_config(path: Option<&Path>) -> Result<(), CoachError> {
    let config = CoachConfig::default();
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    info!("Default configuration written");
    Ok(())
}

fn main() {
    colog::init();

    let cli = Args::parse();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("Exiting...");
        std::process::exit(0);
    }) {
        warn!("Could not set Ctrl-C handler: {e}");
    }

    let result = match cli.command {
        Commands::Run {
            addr,
            arm,
            train_seconds,
            snapshot,
            events,
            config,
        } => run(
            addr,
            config,
            events,
            RunOptions {
                arm: arm.into(),
                train_seconds,
                snapshot,
            },
        ),
        Commands::Serve { addr } => serve(&addr),
        Commands::InitConfig { path } => init_config(path.as_deref()),
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
