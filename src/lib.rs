pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameType, FrameTypeMask, PixelFormat};
pub use error::{Error, Result, Violation};
pub use pipeline::{
    CaptureBuffers, ColorOrder, FrameArray, FrameConverter, FrameSet, FrameSetGuard, ImageArray,
    SyncMultiFrameListener,
};
pub use session::CaptureSession;

use capture::driver::PacketPipeline;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `KINECT_SYNC__CAPTURE__FPS=15`
pub const ENV_PREFIX: &str = "KINECT_SYNC";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub listener: ListenerConfig,
    pub conversion: ConversionConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub device_index: usize,
    pub pipeline: PacketPipeline,
    pub fps: u32,
    pub color_width: usize,
    pub color_height: usize,
    pub depth_width: usize,
    pub depth_height: usize,
    /// Frame buffers per stream; unreleased sets hold one each
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub types: FrameTypeMask,
    /// Partially filled capture cycles open at once
    pub max_pending_sets: usize,
    /// How long a producer opening a new cycle waits for room before the
    /// oldest partial cycle is evicted
    pub max_pending_wait_ms: u64,
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub color_order: ColorOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    pub frames: u64,
    pub warmup: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        // Kinect v2 native geometry
        Self {
            device_index: 0,
            pipeline: PacketPipeline::Cpu,
            fps: 30,
            color_width: 1920,
            color_height: 1080,
            depth_width: 512,
            depth_height: 424,
            pool_size: 8,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            types: FrameType::Color | FrameType::Depth,
            max_pending_sets: 4,
            max_pending_wait_ms: 500,
            wait_timeout_ms: 1000,
        }
    }
}

impl ListenerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn max_pending_wait(&self) -> Duration {
        Duration::from_millis(self.max_pending_wait_ms)
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 100,
            warmup: 10,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `KINECT_SYNC__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Snapshot of the active global configuration
    pub fn current() -> std::sync::Arc<Config> {
        CONFIG.load_full()
    }
}
