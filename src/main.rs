//! CLI entry point for hex-flyscan
//!
//! Runs tomography plans against the simulated endstation:
//! - `fly`: hardware-triggered flyscan
//! - `dark-flat`: software-triggered calibration frames
//! - `collect`: plain camera acquisition, software or hardware triggered
//! - `plan`: print the trigger schedule without touching hardware
//!
//! # Usage
//!
//! ```bash
//! hex-flyscan plan --num-images 1801 --exposure 0.01
//! hex-flyscan fly --start 0 --stop 180 --scan-time 20
//! hex-flyscan dark-flat --frame-type flat --num-images 20
//! hex-flyscan collect --num-images 10 --exposure 0.1
//! ```
//!
//! Ctrl-C during a plan aborts it; cleanup still runs before the process
//! exits.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flyscan_core::timing::ScanTimingSpec;
use flyscan_experiment::plans::{dark_flat, kinetix_collect, tomo_flyscan, CollectRequest, DarkFlatRequest};
use flyscan_experiment::{abort_channel, AbortHandle};
use hex_flyscan::config::FlyscanConfig;
use hex_flyscan::logging;
use hex_flyscan::simulation::{plan_context, SimulatedEndstation};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hex-flyscan")]
#[command(about = "Tomography flyscan planner and coordinator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = hex_flyscan::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a hardware-triggered flyscan
    Fly(ScanArgs),

    /// Take dark or flat calibration frames
    DarkFlat {
        /// Frame type
        #[arg(long, value_enum, default_value_t = Calibration::Dark)]
        frame_type: Calibration,

        /// Number of frames
        #[arg(long)]
        num_images: Option<u32>,

        /// Exposure per frame (s)
        #[arg(long)]
        exposure: Option<f64>,

        /// Sample stage offset for flats
        #[arg(long)]
        sample_offset: Option<f64>,
    },

    /// Acquire camera frames without moving anything
    Collect {
        /// Number of frames
        #[arg(long, default_value_t = 10)]
        num_images: u32,

        /// Exposure per frame (s)
        #[arg(long, default_value_t = 0.1)]
        exposure: f64,

        /// Wait for pulses on the trigger input instead of free-running
        #[arg(long)]
        hardware_trigger: bool,
    },

    /// Print the trigger schedule as JSON
    Plan(ScanArgs),
}

/// Overrides for the configured scan.
#[derive(Args)]
struct ScanArgs {
    /// First projection angle (deg)
    #[arg(long)]
    start: Option<f64>,

    /// Last projection angle (deg)
    #[arg(long)]
    stop: Option<f64>,

    /// Number of projections
    #[arg(long)]
    num_images: Option<u32>,

    /// Exposure per frame (s)
    #[arg(long)]
    exposure: Option<f64>,

    /// Time to sweep the range (s); derived from the exposure when 0
    #[arg(long)]
    scan_time: Option<f64>,

    /// Run-up and run-out margin (deg)
    #[arg(long)]
    lead_angle: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Calibration {
    Dark,
    Flat,
}

impl ScanArgs {
    fn apply(&self, base: ScanTimingSpec) -> ScanTimingSpec {
        let mut spec = base.with_range(
            self.start.unwrap_or(base.start_angle),
            self.stop.unwrap_or(base.stop_angle),
        );
        if let Some(n) = self.num_images {
            spec = spec.with_num_images(n);
        }
        if let Some(exposure) = self.exposure {
            spec = spec.with_exposure(Some(exposure));
        }
        if let Some(scan_time) = self.scan_time {
            spec = spec.with_scan_time((scan_time > 0.0).then_some(scan_time));
        }
        if let Some(lead) = self.lead_angle {
            spec = spec.with_lead_angle(lead);
        }
        spec
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FlyscanConfig::load_from(&cli.config)?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Plan(args) => print_plan(&config, &args),
        Commands::Fly(args) => run_flyscan(&config, &args).await,
        Commands::DarkFlat {
            frame_type,
            num_images,
            exposure,
            sample_offset,
        } => {
            let calibration = &config.calibration;
            let num_images = num_images.unwrap_or(calibration.num_images);
            let exposure = exposure.unwrap_or(calibration.exposure_time);
            let request = match frame_type {
                Calibration::Dark => DarkFlatRequest::dark(num_images, exposure),
                Calibration::Flat => DarkFlatRequest::flat(
                    num_images,
                    exposure,
                    sample_offset.unwrap_or(calibration.sample_offset),
                ),
            };
            run_dark_flat(&config, &request).await
        }
        Commands::Collect {
            num_images,
            exposure,
            hardware_trigger,
        } => {
            let request = CollectRequest {
                num_images,
                exposure_time: exposure,
                software_trigger: !hardware_trigger,
            };
            run_collect(&config, &request).await
        }
    }
}

fn print_plan(config: &FlyscanConfig, args: &ScanArgs) -> Result<()> {
    let spec = args.apply(config.scan);
    let ctx = plan_context(config);
    let schedule = ctx.planner.plan(&spec, config.devices.readout_mode)?;
    println!("{}", serde_json::to_string_pretty(&schedule)?);
    Ok(())
}

async fn run_flyscan(config: &FlyscanConfig, args: &ScanArgs) -> Result<()> {
    let spec = args.apply(config.scan);
    let station = SimulatedEndstation::from_config(config);
    let (handle, signal) = abort_channel();
    watch_ctrl_c(handle);
    let ctx = plan_context(config).with_abort(signal);
    let mut session = config.session.context();

    let report = tomo_flyscan(&station.instrument, &spec, &ctx, &mut session).await?;
    if !report.counts_agree() {
        warn!(frames = ?report.drain.frames, "Frame counts differ between detectors");
    }
    info!(
        scan_id = report.scan_id,
        run_id = %report.run_id,
        polls = report.drain.polls,
        "Flyscan finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_dark_flat(config: &FlyscanConfig, request: &DarkFlatRequest) -> Result<()> {
    let station = SimulatedEndstation::from_config(config);
    let (handle, signal) = abort_channel();
    watch_ctrl_c(handle);
    let ctx = plan_context(config).with_abort(signal);
    let mut session = config.session.context();

    let report = dark_flat(&station.instrument, request, &ctx, &mut session).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_collect(config: &FlyscanConfig, request: &CollectRequest) -> Result<()> {
    let station = SimulatedEndstation::from_config(config);
    let camera = station
        .instrument
        .camera
        .as_ref()
        .ok_or_else(|| anyhow!("No camera installed on this endstation"))?;
    let (handle, signal) = abort_channel();
    watch_ctrl_c(handle);
    let ctx = plan_context(config).with_abort(signal);

    let report = kinetix_collect(camera, request, &ctx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn watch_ctrl_c(handle: AbortHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting");
            handle.abort("operator interrupt");
        }
    });
}
