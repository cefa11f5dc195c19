use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use roadscan::broadcast::Broadcaster;
use roadscan::recorder::annotate_session;
use roadscan::sensor::{SyntheticProfile, SyntheticSource};
use roadscan::store::FsStore;
use roadscan::timesync::{SntpClock, TimeSync};
use roadscan::{
    run_calibration, Annotation, CalibrationOutcome, CalibrationProfile, CalibrationWindow,
    Config, ProfileStore, SensorHub, SessionCalibration, SessionRecorder, SessionReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "roadscan", version, about = "Record and calibrate road-surface sensor sessions")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate the mounted device and store the profile
    Calibrate,
    /// Record a session from the built-in synthetic sensor
    Record {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Skip the short calibration before recording
        #[arg(long)]
        skip_precal: bool,
        /// Simulate a bump every few seconds
        #[arg(long)]
        bumps: bool,
    },
    /// Reclassify rows of a finished session
    Annotate {
        /// Session directory
        #[arg(long)]
        session: PathBuf,
        /// Event timestamp, ms since session start
        #[arg(long)]
        at: i64,
        #[arg(long, default_value_t = 500)]
        window: i64,
        #[arg(long, default_value = "")]
        label: String,
        /// Mark the rows as not an event
        #[arg(long)]
        clear: bool,
    },
    /// Show or remove the stored calibration profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ProfileAction {
    Show,
    Clear,
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Calibrate => calibrate(&config),
        Command::Record {
            seconds,
            skip_precal,
            bumps,
        } => record(&config, seconds, skip_precal, bumps),
        Command::Annotate {
            session,
            at,
            window,
            label,
            clear,
        } => {
            let annotation = Annotation {
                timestamp_ms: at,
                window_ms: window,
                is_event: !clear,
                feedback: label,
            };
            let updated = annotate_session(&FsStore, &session, &annotation)?;
            println!("Updated {} rows", updated);
            Ok(())
        }
        Command::Profile { action } => {
            let store = ProfileStore::default_location();
            match action {
                ProfileAction::Show => match store.load()? {
                    Some(profile) => println!("{}", toml::to_string_pretty(&profile)?),
                    None => println!("No calibration profile at {}", store.path().display()),
                },
                ProfileAction::Clear => {
                    store.clear()?;
                    println!("Calibration profile cleared");
                }
            }
            Ok(())
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Stand-in for the platform sensor: slightly biased, mounted flat
fn synthetic_hub(config: &Config, bumps: bool) -> SensorHub {
    SensorHub::new(SyntheticSource::new(SyntheticProfile {
        rate_hz: config.calibration.sample_rate_hz,
        gravity: [0.02, -0.01, 9.75],
        bump_every_ms: bumps.then_some(12_000),
        ..SyntheticProfile::default()
    }))
}

fn calibrate(config: &Config) -> Result<()> {
    let hub = synthetic_hub(config, false);
    let progress = Broadcaster::new();
    let states = progress.subscribe();
    let printer = thread::spawn(move || {
        for state in states.iter() {
            println!("  {:?}", state);
        }
    });

    println!("Keep the device still...");
    let outcome = run_calibration(
        &hub,
        CalibrationWindow::initial(&config.calibration),
        Some(&progress),
    );
    drop(progress);
    let _ = printer.join();

    match outcome? {
        CalibrationOutcome::Complete(summary) => {
            let profile = CalibrationProfile::from_summary(&summary, Utc::now());
            let store = ProfileStore::default_location();
            store.save(&profile)?;
            println!(
                "Calibrated {} mount, accel offsets {:?}, gyro offsets {:?}",
                profile.orientation.name(),
                profile.accel_offsets(),
                profile.gyro_offsets()
            );
            Ok(())
        }
        other => bail!("{}", other),
    }
}

fn record(config: &Config, seconds: u64, skip_precal: bool, bumps: bool) -> Result<()> {
    let profile = match ProfileStore::default_location().load()? {
        Some(profile) => profile,
        None => {
            log::warn!("No calibration profile, run `roadscan calibrate` first. Recording uncorrected");
            CalibrationProfile::default()
        }
    };

    let hub = synthetic_hub(config, bumps);
    let session_calibration = if skip_precal {
        None
    } else {
        println!("Pre-recording calibration, keep the device still...");
        match run_calibration(&hub, CalibrationWindow::session(&config.calibration), None)? {
            CalibrationOutcome::Complete(summary) => Some(SessionCalibration::from_summary(
                &summary,
                &profile,
                &config.calibration,
            )),
            other => {
                log::warn!("{}; using default event threshold", other);
                None
            }
        }
    };

    let time_sync = TimeSync::new(
        SntpClock::new(
            config.clock.ntp_server.clone(),
            Duration::from_millis(config.clock.query_timeout_ms),
        ),
        config.clock.max_uncertainty_ms,
    );
    let mut recorder =
        SessionRecorder::new(config.clone(), Arc::new(FsStore)).with_time_sync(time_sync);
    recorder.on_failure(|failure| {
        log::error!(
            "Storage failing ({} consecutive, {} rows held in memory): {}",
            failure.consecutive_failures,
            failure.unwritten.len(),
            failure.error
        );
    });

    let samples = recorder.sample_feed();
    let info = recorder.start(&hub, profile, session_calibration)?;
    println!("Recording to {} for {} s", info.data_file.display(), seconds);

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match samples.recv_timeout(remaining) {
            Ok(Ok(sample)) if sample.is_event => println!(
                "  bump at {} ms ({:.2} m/s²)",
                sample.relative_timestamp_ms, sample.accel_magnitude
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("{}", e),
            Err(_) => break,
        }
    }

    let report = recorder.stop()?;
    print_report(&report);
    if !report.all_writes_succeeded {
        bail!("{} rows were not written", report.unwritten.len());
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!("Session {}", report.info.session_id);
    println!("  file:          {}", report.info.data_file.display());
    println!("  rows:          {}", report.rows_persisted);
    println!("  events:        {}", report.events_detected);
    println!("  sampling rate: {:.1} Hz", report.sampling_rate_hz);
    println!(
        "  clock:         {}",
        if report.stamps.synchronized {
            format!("reference ({:+} ms)", report.stamps.offset_ms)
        } else {
            "device UTC".to_string()
        }
    );
    println!(
        "  all writes ok: {}{}",
        report.all_writes_succeeded,
        if report.timed_out { " (stop timed out)" } else { "" }
    );
}
