//! In-process driver producing deterministic frames.
//!
//! Each device runs a clock thread that ticks once per capture cycle and two
//! stream threads, one for color and one for ir + depth, the way the Kinect
//! driver splits its USB endpoints. Stream threads fill pool slots and hand
//! them to the registered listeners.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::capture::driver::{Device, Driver, FrameListener, PacketPipeline};
use crate::capture::frame::{FrameMeta, FrameType, PixelFormat};
use crate::capture::pool::{FramePool, PoolStats};
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Depth value the synthetic device writes at `pixel` of cycle `sequence`, in millimeters.
pub fn depth_value(pixel: usize, sequence: u64) -> f32 {
    500.0 + ((pixel as u64 + sequence) % 4000) as f32
}

pub fn ir_value(pixel: usize, sequence: u64) -> f32 {
    ((pixel as u64 * 3 + sequence) % 65536) as f32
}

/// BGRX bytes the synthetic device writes at (`x`, `y`) of cycle `sequence`.
pub fn color_value(x: usize, y: usize, sequence: u64) -> [u8; 4] {
    [
        (x as u64 + sequence) as u8,
        y as u8,
        (x + y) as u8,
        0xff,
    ]
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    sequence: u64,
    timestamp: Duration,
}

/// Per-device state shared between the driver, the device handle and its threads
struct DeviceShared {
    serial: String,
    color: FramePool,
    ir: FramePool,
    depth: FramePool,
    undelivered: AtomicU64,
}

impl DeviceShared {
    fn pool(&self, kind: FrameType) -> &FramePool {
        match kind {
            FrameType::Color => &self.color,
            FrameType::Ir => &self.ir,
            FrameType::Depth => &self.depth,
        }
    }
}

pub struct SyntheticDriver {
    config: CaptureConfig,
    devices: Vec<Arc<DeviceShared>>,
    frame_limit: Option<u64>,
}

impl SyntheticDriver {
    pub fn new(device_count: usize, config: CaptureConfig) -> Self {
        let devices = (0..device_count)
            .map(|index| {
                Arc::new(DeviceShared {
                    serial: format!("SYN{index:09}"),
                    color: FramePool::new(config.pool_size),
                    ir: FramePool::new(config.pool_size),
                    depth: FramePool::new(config.pool_size),
                    undelivered: AtomicU64::new(0),
                })
            })
            .collect();

        Self {
            config,
            devices,
            frame_limit: None,
        }
    }

    /// Stop ticking after `cycles` capture cycles.
    pub fn with_frame_limit(mut self, cycles: u64) -> Self {
        self.frame_limit = Some(cycles);
        self
    }

    pub fn pool_stats(&self, index: usize, kind: FrameType) -> Option<PoolStats> {
        self.devices.get(index).map(|device| device.pool(kind).stats())
    }

    /// Frames dropped because every pool slot was still held by the consumer
    pub fn undelivered(&self, index: usize) -> u64 {
        self.devices
            .get(index)
            .map_or(0, |device| device.undelivered.load(Ordering::Relaxed))
    }
}

impl Driver for SyntheticDriver {
    fn enumerate_devices(&self) -> usize {
        self.devices.len()
    }

    fn device_serial_number(&self, index: usize) -> Option<String> {
        self.devices.get(index).map(|device| device.serial.clone())
    }

    fn open_device(&self, index: usize, pipeline: PacketPipeline) -> Result<Box<dyn Device>> {
        let shared = self
            .devices
            .get(index)
            .cloned()
            .ok_or_else(|| Error::DeviceFailure(format!("no device at index {index}")))?;
        info!(serial = %shared.serial, %pipeline, "opened synthetic device");

        Ok(Box::new(SyntheticDevice {
            shared,
            config: self.config.clone(),
            frame_limit: self.frame_limit,
            color_listener: None,
            depth_listener: None,
            running: None,
            closed: false,
        }))
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

pub struct SyntheticDevice {
    shared: Arc<DeviceShared>,
    config: CaptureConfig,
    frame_limit: Option<u64>,
    color_listener: Option<Arc<dyn FrameListener>>,
    depth_listener: Option<Arc<dyn FrameListener>>,
    running: Option<Running>,
    closed: bool,
}

impl SyntheticDevice {
    fn spawn_stream(
        &self,
        name: &str,
        listener: Arc<dyn FrameListener>,
        streams: Vec<FrameMeta>,
        ticks: Receiver<Tick>,
    ) -> Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("{}-{name}", shared.serial))
            .spawn(move || {
                for tick in ticks.iter() {
                    for meta in &streams {
                        emit(&shared, listener.as_ref(), *meta, tick);
                    }
                }
            })
            .map_err(|e| Error::DeviceFailure(format!("failed to spawn {name} thread: {e}")))
    }

    fn spawn_clock(&self, stop: Arc<AtomicBool>, senders: Vec<Sender<Tick>>) -> Result<JoinHandle<()>> {
        let interval = match self.config.fps {
            0 => Duration::ZERO,
            fps => Duration::from_secs(1) / fps,
        };
        let limit = self.frame_limit;
        thread::Builder::new()
            .name(format!("{}-clock", self.shared.serial))
            .spawn(move || {
                let epoch = Instant::now();
                let mut sequence = 0u64;
                while !stop.load(Ordering::Acquire) {
                    if limit.is_some_and(|limit| sequence >= limit) {
                        break;
                    }
                    sequence += 1;
                    let tick = Tick {
                        sequence,
                        timestamp: epoch.elapsed(),
                    };
                    if senders.iter().any(|tx| tx.send(tick).is_err()) {
                        break;
                    }
                    if !interval.is_zero() {
                        thread::sleep(interval);
                    }
                }
                debug!(cycles = sequence, "synthetic clock finished");
            })
            .map_err(|e| Error::DeviceFailure(format!("failed to spawn clock thread: {e}")))
    }
}

fn emit(shared: &DeviceShared, listener: &dyn FrameListener, meta: FrameMeta, tick: Tick) {
    let Some(mut writer) = shared.pool(meta.kind).acquire(meta) else {
        let count = shared.undelivered.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 100 == 0 {
            warn!(
                kind = %meta.kind,
                undelivered = count,
                "frame pool exhausted, release frame sets to resume capture"
            );
        }
        return;
    };

    let width = meta.width.max(1);
    let data = writer.data_mut();
    match meta.kind {
        FrameType::Color => {
            for (pixel, out) in data.chunks_exact_mut(4).enumerate() {
                out.copy_from_slice(&color_value(pixel % width, pixel / width, tick.sequence));
            }
        }
        FrameType::Ir => {
            for (pixel, out) in data.chunks_exact_mut(4).enumerate() {
                out.copy_from_slice(&ir_value(pixel, tick.sequence).to_ne_bytes());
            }
        }
        FrameType::Depth => {
            for (pixel, out) in data.chunks_exact_mut(4).enumerate() {
                out.copy_from_slice(&depth_value(pixel, tick.sequence).to_ne_bytes());
            }
        }
    }

    listener.on_new_frame(writer.finish(tick.sequence, tick.timestamp));
}

impl Device for SyntheticDevice {
    fn serial_number(&self) -> &str {
        &self.shared.serial
    }

    fn set_color_listener(&mut self, listener: Option<Arc<dyn FrameListener>>) {
        self.color_listener = listener;
    }

    fn set_ir_and_depth_listener(&mut self, listener: Option<Arc<dyn FrameListener>>) {
        self.depth_listener = listener;
    }

    fn start_streams(&mut self, color: bool, ir_and_depth: bool) -> Result<()> {
        if self.closed {
            return Err(Error::DeviceFailure(format!(
                "device {} is closed",
                self.shared.serial
            )));
        }
        if self.running.is_some() {
            warn!(serial = %self.shared.serial, "device already streaming");
            return Ok(());
        }

        let config = &self.config;
        let capacity = config.pool_size.max(1);
        let mut senders = Vec::new();
        let mut threads = Vec::new();

        if let (true, Some(listener)) = (color, self.color_listener.clone()) {
            let (tx, rx) = flume::bounded(capacity);
            let streams = vec![FrameMeta::new(
                FrameType::Color,
                config.color_width,
                config.color_height,
                PixelFormat::Bgrx,
            )];
            threads.push(self.spawn_stream("color", listener, streams, rx)?);
            senders.push(tx);
        }
        if let (true, Some(listener)) = (ir_and_depth, self.depth_listener.clone()) {
            let (tx, rx) = flume::bounded(capacity);
            let streams = vec![
                FrameMeta::new(FrameType::Ir, config.depth_width, config.depth_height, PixelFormat::Float),
                FrameMeta::new(FrameType::Depth, config.depth_width, config.depth_height, PixelFormat::Float),
            ];
            threads.push(self.spawn_stream("depth", listener, streams, rx)?);
            senders.push(tx);
        }

        let stop = Arc::new(AtomicBool::new(false));
        // Clock goes first so stop() joins it before the stream threads drain
        threads.insert(0, self.spawn_clock(Arc::clone(&stop), senders)?);

        info!(
            serial = %self.shared.serial,
            color,
            ir_and_depth,
            fps = config.fps,
            "synthetic device streaming"
        );
        self.running = Some(Running { stop, threads });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.stop.store(true, Ordering::Release);
        for handle in running.threads {
            if handle.join().is_err() {
                warn!(serial = %self.shared.serial, "synthetic stream thread panicked");
            }
        }
        info!(serial = %self.shared.serial, "synthetic device stopped");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        self.color_listener = None;
        self.depth_listener = None;
        self.closed = true;
        Ok(())
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
