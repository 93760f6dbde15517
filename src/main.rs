//! CLI Entry Point for tm-daq
//!
//! # Usage
//!
//! Poll the modules described in a run file until Ctrl-C:
//! ```bash
//! tm-daq run --config config/run.example.toml
//! ```
//!
//! List firmware dialects:
//! ```bash
//! tm-daq firmwares
//! ```
//!
//! Convert a raw code by hand:
//! ```bash
//! tm-daq convert E1 72a4ff --slope 3.9 --intercept 723.0
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tm_daq::calibration::{convert, LinearFit};
use tm_daq::config::RunConfig;
use tm_daq::firmware::{SensorName, AVAILABLE_FIRMWARES};
use tm_daq::tracing_init::{self, OutputFormat, TracingConfig};
use tm_daq::TelemetryEvent;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tm-daq")]
#[command(about = "Thermal-mockup sensor telemetry over a serial link", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured module until interrupted
    Run {
        /// Path to the TOML run configuration
        #[arg(long)]
        config: PathBuf,

        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "compact")]
        log_format: String,
    },

    /// List registered firmware dialects
    Firmwares,

    /// Print the conversion chain for one raw reading
    Convert {
        /// Sensor name, e.g. E1 or P2
        sensor: String,

        /// Raw token as printed by the module, e.g. 72a4ff
        raw: String,

        /// Calibration slope (ohms per °C)
        #[arg(long, requires = "intercept", allow_hyphen_values = true)]
        slope: Option<f64>,

        /// Calibration intercept (ohms at 0 °C)
        #[arg(long, requires = "slope", allow_hyphen_values = true)]
        intercept: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_format } => run(config, &log_format).await,
        Commands::Firmwares => {
            for name in AVAILABLE_FIRMWARES {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Convert {
            sensor,
            raw,
            slope,
            intercept,
        } => convert_once(&sensor, &raw, slope.zip(intercept)),
    }
}

fn convert_once(sensor: &str, raw: &str, fit: Option<(f64, f64)>) -> Result<()> {
    let sensor: SensorName = sensor.parse()?;
    let fit = fit.map(|(slope, intercept)| LinearFit::new(slope, intercept));
    let conversion = convert(sensor, raw, fit.as_ref());

    let show = |value: Option<f64>| {
        value.map_or_else(|| "undefined".to_string(), |v| format!("{:.6}", v))
    };
    println!("sensor:   {}", sensor);
    println!("raw:      {}", raw);
    println!("volts:    {}", show(conversion.volts));
    println!("ohms:     {}", show(conversion.ohms));
    println!("measured: {}", show(conversion.measured));
    println!("celsius:  {}", show(conversion.celsius));
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn run(config_path: PathBuf, log_format: &str) -> Result<()> {
    use tm_daq::transport::SerialTransport;

    let config = RunConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate()?;

    let format: OutputFormat = log_format.parse()?;
    tracing_init::init(TracingConfig::from_run_config(&config)?.with_format(format))?;

    let mut engine = config.build_engine()?;
    let (mut link, inbound) = SerialTransport::open(&config.serial.port, config.serial.baud_rate)
        .await
        .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;

    tokio::spawn(log_events(engine.subscribe()));

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
        let _ = stop_tx.send(());
    });

    info!(port = %config.serial.port, "Polling; press Ctrl-C to stop");
    engine.run(&mut link, inbound, stop_rx).await?;
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
async fn run(_config_path: PathBuf, _log_format: &str) -> Result<()> {
    anyhow::bail!("tm-daq was built without the `instrument_serial` feature")
}

async fn log_events(mut events: broadcast::Receiver<TelemetryEvent>) {
    loop {
        match events.recv().await {
            Ok(TelemetryEvent::SensorReading {
                module,
                sensor,
                reading,
                conversion,
            }) => info!(
                %module,
                %sensor,
                raw = %reading.raw,
                ohms = ?conversion.ohms,
                celsius = ?conversion.celsius,
                "Reading"
            ),
            Ok(TelemetryEvent::BumpBondReading {
                module,
                path_id,
                volts,
                ohms,
                ..
            }) => info!(%module, path_id, volts, ohms, "Bump-bond reading"),
            Ok(TelemetryEvent::ZeroReadingDiscarded { module, sensor }) => {
                warn!(%module, %sensor, "Discarded zero reading")
            }
            Ok(TelemetryEvent::CommandSent { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event logger fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
