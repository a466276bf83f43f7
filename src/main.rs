//! `spectro` command line.
//!
//! # Usage
//!
//! ```bash
//! # Inspect and rewrite EEPROM dumps (6 x 64 bytes)
//! spectro decode eeprom.bin
//! spectro reencode eeprom.bin eeprom.new.bin
//!
//! # Stream a few readings through the worker
//! spectro run --device mock:WP-00001 --frames 20 --set integration_time_ms=200
//!
//! # Balance a device to a target peak
//! spectro balance --device mock:WP-00001 --mode laser_then_integration --intensity 40000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use spectro_daq::balance::{BalanceMode, Balancer};
use spectro_daq::config::Settings;
use spectro_daq::device::{BackendRegistry, DeviceId, DeviceSession};
use spectro_daq::eeprom::codec::{PAGE_COUNT, PAGE_SIZE};
use spectro_daq::eeprom::ConfigRecord;
use spectro_daq::logging::{self, LogHandle};
use spectro_daq::worker::{AcquisitionMode, WorkerSession};
use spectro_daq::SpectroError;

/// Spectrometer EEPROM, acquisition and balancing tool
#[derive(Parser, Debug)]
#[command(name = "spectro", version)]
#[command(about = "Spectrometer EEPROM, acquisition and balancing tool")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a 384-byte EEPROM dump and print it as JSON
    Decode {
        file: PathBuf,
    },

    /// Decode a dump and write freshly encoded pages
    Reencode {
        input: PathBuf,
        output: PathBuf,
    },

    /// Start a worker, apply settings and print readings
    Run {
        /// Device identifier, scheme:address
        #[arg(long)]
        device: String,

        /// Readings to collect before disconnecting
        #[arg(long, default_value_t = 10)]
        frames: usize,

        /// keep-all, latest or keep-complete
        #[arg(long, default_value = "keep-complete")]
        mode: String,

        /// Setting to apply after connect, as name=value (repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        settings: Vec<String>,
    },

    /// Balance integration time and/or laser power to a target peak
    Balance {
        /// Device identifier, scheme:address
        #[arg(long)]
        device: String,

        /// integration, laser or laser_then_integration
        #[arg(long)]
        mode: Option<String>,

        /// Target peak intensity (counts)
        #[arg(long)]
        intensity: Option<f64>,

        /// Accepted distance from the target (counts)
        #[arg(long)]
        threshold: Option<f64>,

        /// Pixel to use as the peak instead of the spectrum maximum
        #[arg(long)]
        pixel: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    let log_handle = logging::init(&settings.logging)?;

    match cli.command {
        Command::Decode { file } => decode(&file),
        Command::Reencode { input, output } => reencode(&settings, &input, &output),
        Command::Run {
            device,
            frames,
            mode,
            settings: assignments,
        } => {
            let mode: AcquisitionMode = mode.parse()?;
            run(&settings, log_handle, &device, frames, mode, &assignments).await
        }
        Command::Balance {
            device,
            mode,
            intensity,
            threshold,
            pixel,
        } => {
            let mut balancer = Balancer::from_config(&settings.balance);
            if let Some(mode) = mode {
                balancer.mode = mode.parse::<BalanceMode>()?;
            }
            if let Some(intensity) = intensity {
                balancer.intensity = intensity;
            }
            if let Some(threshold) = threshold {
                balancer.threshold = threshold;
            }
            if pixel.is_some() {
                balancer.pixel = pixel;
            }
            balance(log_handle, &device, &balancer).await
        }
    }
}

fn read_pages(path: &Path) -> Result<ConfigRecord> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < PAGE_COUNT * PAGE_SIZE {
        warn!(
            len = bytes.len(),
            expected = PAGE_COUNT * PAGE_SIZE,
            "short EEPROM dump"
        );
    }
    let pages: Vec<Vec<u8>> = bytes.chunks(PAGE_SIZE).map(<[u8]>::to_vec).collect();
    Ok(ConfigRecord::parse(&pages)?)
}

fn decode(file: &Path) -> Result<()> {
    let record = read_pages(file)?;
    record.dump();
    println!("{}", record.to_json()?);
    Ok(())
}

fn reencode(settings: &Settings, input: &Path, output: &Path) -> Result<()> {
    let record = read_pages(input)?;
    let buffers = record.generate_write_buffers(settings.eeprom.latest_revision)?;
    if !buffers.truncated.is_empty() {
        warn!(fields = ?buffers.truncated, "some string fields were truncated");
    }
    std::fs::write(output, buffers.to_bytes())
        .with_context(|| format!("writing {}", output.display()))?;
    info!(output = %output.display(), "wrote {} bytes", PAGE_COUNT * PAGE_SIZE);
    Ok(())
}

async fn run(
    settings: &Settings,
    log_handle: LogHandle,
    device: &str,
    frames: usize,
    mode: AcquisitionMode,
    assignments: &[String],
) -> Result<()> {
    let device_id: DeviceId = device.parse()?;
    let registry = Arc::new(BackendRegistry::with_defaults());
    let mut session = WorkerSession::new(device_id, settings.worker.clone(), registry)
        .with_log_handle(Some(log_handle));

    if let Err(e) = session.connect().await {
        session.disconnect().await;
        return Err(e.into());
    }

    for assignment in assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            session.disconnect().await;
            bail!("expected NAME=VALUE, got '{assignment}'");
        };
        if let Err(e) = session.set(name.trim(), value.trim()) {
            session.disconnect().await;
            return Err(e.into());
        }
    }

    let mut ticker = tokio::time::interval(settings.worker.poll_interval());
    let mut collected = 0;
    while collected < frames {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        match session.acquire_data(mode) {
            Ok(Some(reading)) => {
                collected += 1;
                println!(
                    "{} count={} averaged={} integration_ms={} peak={:.1}",
                    reading.timestamp.to_rfc3339(),
                    reading.session_count,
                    reading.averaged,
                    reading.integration_time_ms,
                    reading.peak(None).unwrap_or(f64::NAN),
                );
            }
            Ok(None) => {}
            Err(SpectroError::WorkerTerminated) => {
                warn!("worker terminated early");
                break;
            }
            Err(e) => {
                session.disconnect().await;
                return Err(e.into());
            }
        }
    }

    session.disconnect().await;
    info!(collected, "done");
    Ok(())
}

async fn balance(log_handle: LogHandle, device: &str, balancer: &Balancer) -> Result<()> {
    let device_id: DeviceId = device.parse()?;
    let registry = BackendRegistry::with_defaults();
    let mut session = DeviceSession::new(device_id, &registry)?.with_log_handle(Some(log_handle));
    session.connect().await?;

    let balanced = balancer.balance(&mut session).await;
    let state = session.state().clone();
    session.disconnect().await;

    println!(
        "balanced={} integration_time_ms={} laser_power_perc={}",
        balanced, state.integration_time_ms, state.laser_power_perc
    );
    if !balanced {
        bail!("balance did not converge");
    }
    Ok(())
}
