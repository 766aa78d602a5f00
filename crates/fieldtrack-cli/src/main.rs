use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use fieldtrack_geo::doctor;
use fieldtrack_geo::gnss::DEFAULT_BAUD;
use fieldtrack_geo::summary::local_offset;
use fieldtrack_geo::{
    haversine_m, LocationTracker, NmeaSource, PositionSource, TrackerConfig, TrackerEvent, WatchOptions,
};
use fieldtrack_proto::{DailySummary, ExportFormat, GeofenceSpec};

#[derive(Debug, Parser)]
#[command(name = "fieldtrack", version, about = "fieldtrack - location tracking with geofences")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration file.
    Doctor,
    /// Track continuously, logging fixes and geofence transitions.
    Track {
        /// Stop after this many fixes (default: run until Ctrl-C).
        #[arg(long)]
        samples: Option<usize>,
        /// Write a snapshot here when tracking ends.
        #[arg(long)]
        export: Option<String>,
        /// json or csv; anything else writes json.
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Acquire a single fix and print it.
    Fix,
    /// Great-circle distance between two points, in meters.
    Distance {
        #[arg(allow_negative_numbers = true)]
        lat1: f64,
        #[arg(allow_negative_numbers = true)]
        lon1: f64,
        #[arg(allow_negative_numbers = true)]
        lat2: f64,
        #[arg(allow_negative_numbers = true)]
        lon2: f64,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    tracker: TrackerConfig,
    #[serde(default)]
    watch: WatchOptions,
    gnss: GnssCfg,
    #[serde(default)]
    geofence: Vec<GeofenceSpec>,
}

#[derive(Debug, serde::Deserialize)]
struct GnssCfg {
    source: String,
    nmea_device: Option<String>,
    nmea_file: Option<String>,
    baud: Option<u32>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Command::Distance { lat1, lon1, lat2, lon2 } = cli.cmd {
        println!("{:.1} m", haversine_m(lat1, lon1, lat2, lon2));
        return Ok(());
    }

    let cfg = load_config(cli.config.as_deref().context("--config is required")?)?;
    match cli.cmd {
        Command::Doctor => run_doctor(&cfg),
        Command::Track { samples, export, format } => track(&cfg, samples, export, &format).await,
        Command::Fix => fix(&cfg).await,
        Command::Distance { .. } => Ok(()),
    }
}

fn run_doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    doctor::check_tracker(&cfg.tracker)?;
    doctor::check_watch_options(&cfg.watch)?;
    doctor::check_geofences(&cfg.geofence)?;

    let source = build_source(&cfg.gnss)?;
    if !source.is_available() {
        warn!("doctor: gnss source {:?} not present right now", source.origin());
    }
    info!("doctor: OK ({} geofences)", cfg.geofence.len());
    Ok(())
}

fn build_source(g: &GnssCfg) -> Result<NmeaSource> {
    Ok(match g.source.as_str() {
        "nmea-serial" => NmeaSource::serial(
            g.nmea_device.as_ref().context("gnss.nmea_device missing")?,
            g.baud.unwrap_or(DEFAULT_BAUD),
        ),
        "nmea-file" => NmeaSource::file(g.nmea_file.as_ref().context("gnss.nmea_file missing")?),
        other => anyhow::bail!("unknown gnss.source: {}", other),
    })
}

fn build_tracker(cfg: &Config) -> Result<LocationTracker> {
    let tracker = LocationTracker::new(build_source(&cfg.gnss)?, cfg.tracker.clone());
    for spec in &cfg.geofence {
        tracker
            .add_geofence(spec.clone())
            .with_context(|| format!("geofence '{}'", spec.name))?;
    }
    Ok(tracker)
}

async fn track(cfg: &Config, samples: Option<usize>, export: Option<String>, format: &str) -> Result<()> {
    let tracker = build_tracker(cfg)?;
    let mut transitions = tracker.subscribe_transitions();

    let (tx, mut fixes) = mpsc::unbounded_channel::<()>();
    tracker.start(
        move |ev| match ev {
            TrackerEvent::Sample(p) => {
                info!(lat = p.latitude, lon = p.longitude, acc = ?p.accuracy, speed = ?p.speed, "fix");
                let _ = tx.send(());
            }
            TrackerEvent::Error(e) => warn!("fix failed: {}", e),
        },
        &cfg.watch,
    )?;

    let mut seen = 0usize;
    loop {
        tokio::select! {
            Some(()) = fixes.recv() => {
                seen += 1;
                if samples.is_some_and(|n| seen >= n) {
                    break;
                }
            }
            Ok(ev) = transitions.recv() => {
                let verb = if ev.is_inside { "entered" } else { "left" };
                info!(fence = %ev.fence_id, "{} {}", verb, ev.fence_name);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    tracker.stop();

    // Summarize the day of the last fix so replayed logs report their own day.
    let offset = local_offset();
    let date = tracker
        .status()
        .current_position
        .map(|p| p.timestamp.to_offset(offset).date())
        .unwrap_or_else(|| time::OffsetDateTime::now_utc().to_offset(offset).date());
    print_summary(&tracker.daily_summary(date, offset));

    if let Some(path) = export {
        let body = tracker.export_snapshot(format)?;
        std::fs::write(&path, body).with_context(|| format!("write export {}", path))?;
        info!("export: wrote {} ({:?})", path, ExportFormat::from_name(format));
    }
    Ok(())
}

async fn fix(cfg: &Config) -> Result<()> {
    let tracker = build_tracker(cfg)?;
    let p = tracker.get_current_position().await?;
    println!("lat={:.6} lon={:.6}", p.latitude, p.longitude);
    println!("accuracy={:?} altitude={:?} speed={:?} heading={:?}", p.accuracy, p.altitude, p.speed, p.heading);
    println!("timestamp={}", p.timestamp);
    Ok(())
}

fn print_summary(s: &DailySummary) {
    println!("date={}", s.date);
    println!("samples={}", s.sample_count);
    println!("distance_m={:.1}", s.total_distance_m);
    println!("avg_accuracy_m={:.1}", s.average_accuracy_m);
    if let (Some(first), Some(last)) = (&s.first_sample, &s.last_sample) {
        println!("first={} last={}", first.timestamp, last.timestamp);
    }
}
