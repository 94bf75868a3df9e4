//! Lumen CLI
//!
//! Offline tooling around device schemas, traffic logs and configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use wildmatch::WildMatch;

use lumen::lumen_types::{DeviceDefinition, parse_bridge_devices};
use lumen::testing::{PlaybackTransport, format_log, parse_log};
use lumen::{DevicesClient, LumenConfig};

/// Lumen zigbee2mqtt automation tools
#[derive(Parser, Debug)]
#[command(name = "lumen")]
#[command(about = "Lumen zigbee2mqtt automation tools", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = lumen::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the devices described by a bridge/devices JSON dump
    Inspect {
        /// Path to the JSON dump
        devices: PathBuf,

        /// Only show devices whose friendly name matches this glob
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Parse a traffic log and print it in canonical form
    Replay {
        /// Path to the log
        log: PathBuf,

        /// Also play the log against the devices in this bridge/devices dump
        /// and check that they publish what it expects
        #[arg(short, long)]
        devices: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Write the defaults to this file instead
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lumen=info"));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if args.log_json {
        tracing_subscriber::registry().with(filter).with(layer.json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).init();
    }

    match args.command {
        Command::Inspect { devices, filter } => inspect(&devices, filter.as_deref()),
        Command::Replay { log, devices } => replay(&args.config, &log, devices.as_deref()),
        Command::Config { write } => config(&args.config, write),
    }
}

fn load_definitions(path: &Path) -> Result<Vec<DeviceDefinition>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_bridge_devices(&json).with_context(|| format!("Failed to parse {}", path.display()))
}

fn inspect(path: &Path, filter: Option<&str>) -> Result<()> {
    let definitions = load_definitions(path)?;

    let pattern = filter.map(WildMatch::new);
    let mut shown = 0;

    for definition in &definitions {
        if pattern
            .as_ref()
            .is_some_and(|p| !p.matches(&definition.friendly_name))
        {
            continue;
        }

        println!("{}\n", definition);
        shown += 1;
    }

    info!("Showing {} of {} devices", shown, definitions.len());
    Ok(())
}

fn replay(config_path: &Path, path: &Path, devices: Option<&Path>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let events = parse_log(&text).with_context(|| format!("Invalid log {}", path.display()))?;

    let span = events.last().map(|e| e.time).unwrap_or(0.0);
    info!("{} events over {:.2}s", events.len(), span);

    let Some(devices) = devices else {
        print!("{}", format_log(&events));
        return Ok(());
    };

    let config = LumenConfig::load_from(config_path)?;
    let definitions = load_definitions(devices)?;

    let runtime = config.build_runtime();
    let playback = PlaybackTransport::new(&runtime, events);
    let client = DevicesClient::from_config(&runtime, Arc::new(playback.clone()), &config);
    for definition in &definitions {
        client.add_definition(definition);
    }

    client.loop_forever()?;

    print!("{}", playback.report());
    if !playback.playback_success() {
        bail!("Replay of {} did not match", path.display());
    }

    info!("Replay matched");
    Ok(())
}

fn config(path: &Path, write: Option<PathBuf>) -> Result<()> {
    match write {
        Some(target) => {
            LumenConfig::default().write(&target)?;
        }
        None => {
            let config = LumenConfig::load_from(path)?;
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}
