//! Capture demo against the synthetic driver.
//!
//! Usage: `kinect-sync [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kinect_sync::capture::SyntheticDriver;
use kinect_sync::{CaptureSession, Config, FrameConverter, SyncMultiFrameListener};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kinect_sync=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("kinect-sync demo launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    kinect_sync::CONFIG.store(Arc::new(Config::load(path.as_deref())?));
    let config = Config::current();

    let driver = SyntheticDriver::new(1, config.capture.clone());
    let mut session = CaptureSession::open(&driver, config.capture.clone())?;

    let mask = config.listener.types;
    let listener = Arc::new(SyncMultiFrameListener::new(mask));
    session.set_listener(mask, Arc::clone(&listener))?;

    let converter = FrameConverter::new(config.conversion.color_order);
    let mut buffers = session.buffers(&converter);
    let timeout = config.listener.wait_timeout();

    session.start()?;

    // Warmup
    for _ in 0..config.demo.warmup {
        if let Some(set) = listener.wait_for_new_frame(timeout)? {
            listener.release(set);
        }
    }

    let started = Instant::now();
    let mut captured = 0u64;
    let mut timeouts = 0u64;
    while captured < config.demo.frames {
        match listener.wait_for_new_frame_into(&converter, &mut buffers, timeout) {
            Ok(info) => {
                captured += 1;
                if captured % 30 == 0 {
                    info!(sequence = info.sequence, captured, "frame set converted");
                }
            }
            Err(e) if e.is_timeout() => {
                timeouts += 1;
                warn!("no frame set within {:?}", timeout);
                if timeouts > 3 {
                    return Err(eyre!("device stopped delivering frames"));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    let elapsed = started.elapsed();

    session.stop()?;

    let stats = listener.stats();
    info!(
        frames = captured,
        fps = captured as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        dropped = stats.sets_dropped,
        evicted = stats.sets_evicted,
        undelivered = driver.undelivered(0),
        "capture finished"
    );

    session.close()?;
    info!("kinect-sync demo shutting down");
    Ok(())
}
