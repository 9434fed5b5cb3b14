//! FSK player entry point.
//!
//! Lowers privileges at startup, optionally enters real-time mode,
//! encodes the payload, plays its timing, and leaves real-time mode.

mod payload;
mod sink;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fsk_common::config::PlayerConfig;
use fsk_encoder::{encode_block, BitTime};
use fsk_runtime::playback::{PlaybackReport, Player};
use fsk_runtime::realtime::{
    check_rt_capabilities, PrivilegeState, RealtimeController, SystemOps,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::sink::TracingSink;

/// FSK player command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "fsk-play",
    about = "Encode bytes as FSK serial frames and play their timing",
    version,
    long_about = None
)]
struct Args {
    /// Path to a player configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Payload as hex digits (e.g. "55aa00ff").
    #[arg(long, value_name = "HEX", conflicts_with = "text")]
    hex: Option<String>,

    /// Payload as UTF-8 text.
    #[arg(long, value_name = "TEXT")]
    text: Option<String>,

    /// Enter real-time mode around playback (overrides config file).
    #[arg(long, short = 'r')]
    realtime: bool,

    /// Offset below the maximum round-robin priority (overrides config file).
    #[arg(long, short = 'p')]
    priority: Option<u8>,

    /// Baud rate (overrides config file).
    #[arg(long, short = 'b')]
    baud: Option<u32>,

    /// Bit time in ticks (overrides baud rate).
    #[arg(long)]
    bit_time: Option<u16>,

    /// Print the playback report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting FSK player");

    let mut controller = RealtimeController::new();
    let mut config = startup(&mut controller, || load_config(&args))?;

    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    let payload = payload::from_args(args.hex.as_deref(), args.text.as_deref())?;

    info!(
        baud_rate = config.baud_rate,
        bit_time = ?config.bit_time,
        tick = ?config.tick,
        realtime = config.realtime.enabled,
        "Configuration loaded"
    );

    let report = run_session(&mut controller, &config, &payload)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            delays = report.delays,
            transitions = report.transitions,
            expected_us = report.expected_ns / 1_000,
            elapsed_us = report.elapsed_ns / 1_000,
            max_lateness_us = report.max_lateness_ns / 1_000,
            "Playback finished"
        );
    }
    Ok(())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "fsk_play={level},fsk_daemon={level},fsk_runtime={level},fsk_encoder={level},fsk_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Lower privileges, then load the configuration with the real ids.
///
/// Config paths come from the command line and the environment, so they
/// are only opened once the effective ids no longer grant extra access.
fn startup<S, F>(controller: &mut RealtimeController<S>, load: F) -> Result<PlayerConfig>
where
    S: SystemOps,
    F: FnOnce() -> Result<PlayerConfig>,
{
    controller
        .lower_privileges()
        .context("Failed to lower privileges")?;
    let config = load()?;
    controller.configure(&config.realtime);
    Ok(config)
}

/// Where the configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfigSource {
    /// `--config FILE`.
    Flag(PathBuf),
    /// `FSK_CONFIG_PATH`, when it names an existing file.
    Env(PathBuf),
    /// The system-wide file, when present.
    System(PathBuf),
    /// Nothing found.
    Defaults,
}

const SYSTEM_CONFIG_PATH: &str = "/etc/fsk/config.toml";

/// Pick the first usable source: flag, environment, system file, defaults.
fn resolve_config_source(
    flag: Option<&Path>,
    env: Option<PathBuf>,
    system: &Path,
) -> ConfigSource {
    if let Some(path) = flag {
        return ConfigSource::Flag(path.to_path_buf());
    }
    if let Some(path) = env {
        if path.is_file() {
            return ConfigSource::Env(path);
        }
        warn!(path = %path.display(), "FSK_CONFIG_PATH does not name a file, ignoring it");
    }
    if system.is_file() {
        return ConfigSource::System(system.to_path_buf());
    }
    ConfigSource::Defaults
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let source = resolve_config_source(
        args.config.as_deref(),
        std::env::var_os("FSK_CONFIG_PATH").map(PathBuf::from),
        Path::new(SYSTEM_CONFIG_PATH),
    );
    let path = match &source {
        ConfigSource::Flag(path) | ConfigSource::Env(path) | ConfigSource::System(path) => path,
        ConfigSource::Defaults => {
            info!("No configuration file, using defaults");
            return Ok(PlayerConfig::default());
        }
    };
    info!(?source, "Reading configuration");
    PlayerConfig::from_file(path).with_context(|| format!("Bad configuration in {}", path.display()))
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut PlayerConfig, args: &Args) {
    if args.realtime {
        config.realtime.enabled = true;
    }
    if let Some(priority) = args.priority {
        config.realtime.priority = priority;
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
        config.bit_time = None;
    }
    if args.bit_time.is_some() {
        config.bit_time = args.bit_time;
    }
}

/// Enter real-time mode (if configured), encode and play, then leave.
///
/// Real-time mode is always left before returning, whether or not playback
/// succeeded.
fn run_session<S: SystemOps>(
    controller: &mut RealtimeController<S>,
    config: &PlayerConfig,
    payload: &[u8],
) -> Result<PlaybackReport> {
    if config.realtime.enabled {
        let caps = check_rt_capabilities();
        if !caps.can_use_rt_scheduling() {
            warn!(?caps, "Real-time scheduling will probably be refused");
        }
        if config.realtime.lock_memory && !caps.can_lock_memory() {
            warn!(?caps, "Memory locking will probably be refused");
        }

        match controller.enter_real_time(config.realtime.priority) {
            Ok(status) => info!(?status, "Real-time mode entered"),
            Err(e) if e.is_fatal() => bail!("Cannot enter real-time mode: {e}"),
            Err(e) => warn!(%e, "Continuing without real-time scheduling"),
        }
    }

    let result = encode_and_play(config, payload);

    if controller.state() == PrivilegeState::RealTimeActive {
        if let Err(e) = controller.leave_real_time() {
            warn!(%e, "Scheduler state may not be fully restored");
        }
    }

    result
}

fn encode_and_play(config: &PlayerConfig, payload: &[u8]) -> Result<PlaybackReport> {
    let bit_time = BitTime::from_config(config).context("Invalid bit time")?;
    let delays = encode_block(payload, bit_time).context("Failed to encode payload")?;
    info!(
        bytes = payload.len(),
        delays = delays.len(),
        bit_time = bit_time.ticks(),
        "Payload encoded"
    );

    let mut sink = TracingSink::new();
    let report = Player::from_config(config)
        .play(&delays, &mut sink)
        .context("Playback failed")?;
    info!(level_changes = sink.changes(), "Sink drained");
    Ok(report)
}
