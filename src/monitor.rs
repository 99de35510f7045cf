use anyhow::{bail, Context, Result};
use jkbms_lib::bluetooth::BtleplugTransport;
use jkbms_lib::clock::TokioClock;
use jkbms_lib::config::EngineConfig;
use jkbms_lib::manager::SessionManager;
use jkbms_lib::protocol::{DeviceInfo, Settings, Telemetry};
use jkbms_lib::registry::MacAddress;
use jkbms_lib::session::{Session, SessionCounters, SessionState};
use jkbms_lib::transport::TransportEvent;
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use crate::commandline::OutputFormat;

/// Loads the engine configuration and adds the command line devices.
///
/// A missing file is only an error when it was named explicitly.
pub fn load_config(config_file_path: &str, devices: &[String]) -> Result<EngineConfig> {
    let mut config: EngineConfig = if Path::new(config_file_path).exists() {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?
    } else if config_file_path == EngineConfig::DEFAULT_CONFIG_FILE {
        log::debug!("No config file {config_file_path:?}, using defaults");
        EngineConfig::default()
    } else {
        bail!("Config file {config_file_path:?} does not exist");
    };
    config.devices.extend(devices.iter().cloned());
    config.validate().with_context(|| "Invalid configuration")?;
    config
        .targets()
        .with_context(|| "Invalid device address")?;
    Ok(config)
}

#[derive(Serialize)]
struct SessionReport<'a> {
    address: MacAddress,
    state: SessionState,
    counters: &'a SessionCounters,
    settings: Option<&'a Settings>,
    telemetry: Option<&'a Telemetry>,
    device_info: Option<&'a DeviceInfo>,
}

impl<'a> From<&'a Session> for SessionReport<'a> {
    fn from(session: &'a Session) -> Self {
        Self {
            address: session.address(),
            state: session.state(),
            counters: session.counters(),
            settings: session.settings(),
            telemetry: session.telemetry(),
            device_info: session.device_info(),
        }
    }
}

fn print_text<'a>(sessions: impl Iterator<Item = &'a Session>) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    for session in sessions {
        println!("{}: {}", session.address(), session.state());
        if let Some(device_info) = session.device_info() {
            println!(
                "  device: {} hw={} sw={} serial={}",
                device_info.device_name,
                device_info.hardware_version,
                device_info.software_version,
                device_info.serial_number
            );
        }
        if let Some(telemetry) = session.telemetry() {
            println!(
                "  pack: {:.3}V {:.3}A {:.1}W {}% uptime {}",
                telemetry.battery_voltage,
                telemetry.battery_current,
                telemetry.battery_power,
                telemetry.remaining_percent,
                telemetry.uptime
            );
            println!("  cells: {:?}", telemetry.cell_voltages);
            println!(
                "  temperatures: mos={:.1} t1={:.1} t2={:.1}",
                telemetry.mos_temperature, telemetry.temperature_1, telemetry.temperature_2
            );
        }
        if let Some(settings) = session.settings() {
            println!("  settings: {settings:?}");
        }
        println!("  counters: {:?}", session.counters());
    }
    println!("--------------------------");
}

fn print_json<'a>(sessions: impl Iterator<Item = &'a Session>) {
    let reports: Vec<SessionReport> = sessions.map(SessionReport::from).collect();
    let payload = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": reports,
    });
    match serde_json::to_string(&payload) {
        Ok(json_payload) => println!("{json_payload}"),
        Err(e) => error!("Failed to serialize data to JSON string: {e}"),
    }
}

enum Step {
    Interrupted(std::io::Result<()>),
    Tick,
    Report,
    Event(Option<TransportEvent>),
}

pub async fn run(config: EngineConfig, interval: Duration, format: OutputFormat) -> Result<()> {
    if config.devices.is_empty() {
        bail!("No devices configured, use --device or the config file");
    }
    info!(
        "Starting monitor: devices={:?}, interval={interval:?}, format={format:?}",
        config.devices
    );
    let transport = BtleplugTransport::new()
        .await
        .with_context(|| "Cannot open Bluetooth adapter")?;
    let mut manager = SessionManager::new(config, transport, TokioClock)
        .with_context(|| "Cannot create session manager")?;

    let mut ticker = tokio::time::interval(manager.config().tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(interval);
    report.tick().await;

    loop {
        let step = tokio::select! {
            signal = tokio::signal::ctrl_c() => Step::Interrupted(signal),
            _ = ticker.tick() => Step::Tick,
            _ = report.tick() => Step::Report,
            event = manager.next_event() => Step::Event(event),
        };
        match step {
            Step::Interrupted(signal) => {
                signal.with_context(|| "Cannot listen for ctrl-c")?;
                info!("Interrupted, disconnecting");
                break;
            }
            Step::Tick => manager.tick().await,
            Step::Report => match format {
                OutputFormat::Text => print_text(manager.sessions()),
                OutputFormat::Json => print_json(manager.sessions()),
            },
            Step::Event(Some(event)) => {
                manager.handle_event(event);
            }
            Step::Event(None) => {}
        }
    }
    manager.shutdown().await;
    Ok(())
}
