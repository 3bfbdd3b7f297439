//! Capture session: one open device, its listener, and the start/stop lifecycle.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::capture::driver::{Device, Driver, FrameListener};
use crate::capture::frame::{FrameType, FrameTypeMask};
use crate::error::{Error, Result, Violation};
use crate::pipeline::buffers::CaptureBuffers;
use crate::pipeline::convert::FrameConverter;
use crate::pipeline::listener::SyncMultiFrameListener;
use crate::CaptureConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Streaming,
    Closed,
}

pub struct CaptureSession {
    device: Box<dyn Device>,
    config: CaptureConfig,
    listener: Option<Arc<SyncMultiFrameListener>>,
    routed: FrameTypeMask,
    state: SessionState,
}

impl CaptureSession {
    /// Open the configured device through `driver`.
    #[instrument(skip(driver, config), fields(index = config.device_index, pipeline = %config.pipeline))]
    pub fn open(driver: &dyn Driver, config: CaptureConfig) -> Result<Self> {
        let count = driver.enumerate_devices();
        if config.device_index >= count {
            return Err(Error::DeviceFailure(format!(
                "device index {} out of range, {count} connected",
                config.device_index
            )));
        }
        let device = driver.open_device(config.device_index, config.pipeline)?;
        Ok(Self::with_device(device, config))
    }

    /// Open whichever device the driver considers its default, ignoring
    /// `config.device_index`.
    #[instrument(skip(driver, config), fields(pipeline = %config.pipeline))]
    pub fn open_default(driver: &dyn Driver, config: CaptureConfig) -> Result<Self> {
        let device = driver.open_default_device(config.pipeline)?;
        Ok(Self::with_device(device, CaptureConfig { device_index: 0, ..config }))
    }

    fn with_device(device: Box<dyn Device>, config: CaptureConfig) -> Self {
        info!(serial = device.serial_number(), "capture session opened");
        Self {
            device,
            config,
            listener: None,
            routed: FrameTypeMask::EMPTY,
            state: SessionState::Idle,
        }
    }

    pub fn serial_number(&self) -> &str {
        self.device.serial_number()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn listener(&self) -> Option<&Arc<SyncMultiFrameListener>> {
        self.listener.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Route the device streams in `mask` to `listener`.
    ///
    /// The color stream carries color frames; the depth stream carries ir
    /// and depth together, so routing either of those routes both.
    pub fn set_listener(&mut self, mask: FrameTypeMask, listener: Arc<SyncMultiFrameListener>) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::DeviceFailure(
                "listener can only be changed while the session is idle".into(),
            ));
        }

        let color = mask.contains(FrameType::Color);
        let depth = mask.contains(FrameType::Ir) || mask.contains(FrameType::Depth);
        let mut routed = FrameTypeMask::EMPTY;
        if color {
            routed.insert(FrameType::Color);
        }
        if depth {
            routed = routed | FrameType::Ir | FrameType::Depth;
        }
        let needed = listener.mask();
        if !needed.is_subset_of(routed) {
            return Err(Violation::UnroutedStream(needed.difference(routed)).into());
        }

        let sink: Arc<dyn FrameListener> = listener.clone();
        self.device.set_color_listener(color.then(|| Arc::clone(&sink)));
        self.device.set_ir_and_depth_listener(depth.then_some(sink));
        self.routed = routed;
        self.listener = Some(listener);
        info!(?mask, "listener registered");
        Ok(())
    }

    #[instrument(skip(self), fields(serial = self.device.serial_number()))]
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Closed => return Err(Error::DeviceFailure("session is closed".into())),
            SessionState::Idle => {}
        }
        if let Some(listener) = &self.listener {
            // Re-arm after a previous stop
            listener.reset();
        } else {
            warn!("starting without a listener, frames will be discarded by the driver");
        }

        let color = self.routed.contains(FrameType::Color);
        let depth = self.routed.contains(FrameType::Depth);
        self.device.start_streams(color, depth)?;
        self.state = SessionState::Streaming;
        info!(color, depth, "capture started");
        Ok(())
    }

    /// Wake any consumer blocked in a wait, then stop the device.
    ///
    /// The listener goes first so driver threads parked on a full set of
    /// partial cycles are released and the device can join them.
    #[instrument(skip(self), fields(serial = self.device.serial_number()))]
    pub fn stop(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }
        self.state = SessionState::Idle;
        if let Some(listener) = &self.listener {
            listener.stop();
        }
        self.device.stop()?;
        info!("capture stopped");
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Destinations for the allocation-free loop, shaped for the routed streams
    pub fn buffers(&self, converter: &FrameConverter) -> CaptureBuffers {
        let mask = self
            .listener
            .as_ref()
            .map_or(self.routed, |listener| listener.mask());
        CaptureBuffers::new(mask, converter, &self.config)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let stopped = self.stop();
        self.state = SessionState::Closed;
        self.device.close()?;
        info!(serial = self.device.serial_number(), "capture session closed");
        stopped
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("failed to close capture session: {}", e);
        }
    }
}
