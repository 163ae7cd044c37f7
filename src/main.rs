//! camrig: multi-camera acquisition with preview and rate-capped recording

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrig::capture::DefaultBackendFactory;
use camrig::controller::{Controller, ControllerHandle};
use camrig::display::{FrameView, LogView, SnapshotView};
use camrig::Config;
use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "camrig", version, about = "Multi-camera capture and recording")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CAMRIG_CONFIG")]
    config: Option<PathBuf>,

    /// Start recording immediately
    #[arg(short, long)]
    record: bool,

    /// Session directory, a timestamped one under the session root if unset
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Recording rate cap, overrides the configuration
    #[arg(long)]
    save_fps: Option<f64>,

    /// Write the latest preview frame of each camera into this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Seconds between preview snapshots
    #[arg(long, default_value_t = 1.0)]
    snapshot_interval: f64,

    /// List V4L2 capture devices and exit
    #[cfg(feature = "v4l2")]
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrig=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    #[cfg(feature = "v4l2")]
    if args.list_devices {
        for device in camrig::utils::auto_detect_devices()? {
            println!("{}\t{}\t{:?}", device.path, device.card, device.format);
        }
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(fps) = args.save_fps {
        config.pipeline.save_fps = fps;
    }
    info!("camrig launching with {} cameras", config.cameras.len());

    let view: Arc<dyn FrameView> = match &args.snapshot_dir {
        Some(dir) => Arc::new(SnapshotView::new(dir, args.snapshot_interval)?),
        None => Arc::new(LogView),
    };
    let shutdown_timeout = Duration::from_millis(config.controller.shutdown_timeout_ms);

    let mut controller = Controller::new(config, Arc::new(DefaultBackendFactory), view);
    controller.start().await?;

    let (handle, commands) = ControllerHandle::channel(16);
    let runner = tokio::spawn(controller.run(commands));

    if args.record {
        let dir = handle.start_recording(args.session_dir.clone()).await?;
        info!("Recording to {}", dir.display());
    }

    match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run time elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    let status = handle.status().await?;
    if status.recording.is_some() {
        match handle.stop_recording().await {
            Ok(dir) => info!("Session saved in {}", dir.display()),
            Err(e) => warn!("Stopping the recording failed: {}", e),
        }
    }

    // A driver stuck inside a blocking read cannot be cancelled; give the
    // controller its own timeout plus a margin, then leave without it.
    match tokio::time::timeout(shutdown_timeout * 2, handle.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Shutdown failed: {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            error!("Shutdown hung, forcing exit");
            std::process::exit(1);
        }
    }
    if let Err(e) = runner.await {
        warn!("Controller task ended abnormally: {}", e);
    }

    info!("camrig shut down");
    Ok(())
}
