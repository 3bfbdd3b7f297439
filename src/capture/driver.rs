//! Boundary with the camera driver.
//!
//! The driver owns device handles and frame memory; frames reach the core
//! through [`FrameListener::on_new_frame`], called from driver threads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;
use crate::error::{Error, Result};

/// Receives frames from driver callback threads.
///
/// The listener takes ownership of every frame it is handed and is
/// responsible for releasing it, including frames it does not want.
pub trait FrameListener: Send + Sync {
    fn on_new_frame(&self, frame: Frame);
}

/// Where depth packets get decoded.
///
/// Written in configuration as `cpu`, `opengl`, `opencl`, `cuda`, with an
/// optional GPU index for the compute pipelines, e.g. `opencl:1`. Without
/// an index the runtime picks its default device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PacketPipeline {
    #[default]
    Cpu,
    OpenGl,
    OpenCl { device: Option<u32> },
    Cuda { device: Option<u32> },
}

impl PacketPipeline {
    /// GPU the pipeline is pinned to, if any
    pub fn device(&self) -> Option<u32> {
        match self {
            PacketPipeline::OpenCl { device } | PacketPipeline::Cuda { device } => *device,
            PacketPipeline::Cpu | PacketPipeline::OpenGl => None,
        }
    }
}

impl fmt::Display for PacketPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketPipeline::Cpu => "CPU",
            PacketPipeline::OpenGl => "OpenGL",
            PacketPipeline::OpenCl { .. } => "OpenCL",
            PacketPipeline::Cuda { .. } => "CUDA",
        };
        match self.device() {
            Some(device) => write!(f, "{name} (device {device})"),
            None => f.write_str(name),
        }
    }
}

impl FromStr for PacketPipeline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (name, device) = match s.split_once(':') {
            Some((name, index)) => {
                let index = index
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| format!("invalid device index in pipeline {s:?}: {e}"))?;
                (name.trim(), Some(index))
            }
            None => (s.as_str(), None),
        };
        match (name, device) {
            ("cpu", None) => Ok(PacketPipeline::Cpu),
            ("opengl" | "gl", None) => Ok(PacketPipeline::OpenGl),
            ("opencl" | "cl", device) => Ok(PacketPipeline::OpenCl { device }),
            ("cuda", device) => Ok(PacketPipeline::Cuda { device }),
            ("cpu" | "opengl" | "gl", Some(_)) => Err(format!("pipeline {name} takes no device index")),
            (other, _) => Err(format!("unknown packet pipeline: {other}")),
        }
    }
}

impl TryFrom<String> for PacketPipeline {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PacketPipeline> for String {
    fn from(pipeline: PacketPipeline) -> String {
        let name = match pipeline {
            PacketPipeline::Cpu => "cpu",
            PacketPipeline::OpenGl => "opengl",
            PacketPipeline::OpenCl { .. } => "opencl",
            PacketPipeline::Cuda { .. } => "cuda",
        };
        match pipeline.device() {
            Some(device) => format!("{name}:{device}"),
            None => name.to_owned(),
        }
    }
}

pub trait Device: Send {
    fn serial_number(&self) -> &str;

    /// Route color frames to `listener`, or stop routing them with `None`.
    fn set_color_listener(&mut self, listener: Option<Arc<dyn FrameListener>>);

    /// Route ir and depth frames to `listener`, or stop routing them with `None`.
    fn set_ir_and_depth_listener(&mut self, listener: Option<Arc<dyn FrameListener>>);

    fn start_streams(&mut self, color: bool, ir_and_depth: bool) -> Result<()>;

    fn start(&mut self) -> Result<()> {
        self.start_streams(true, true)
    }

    /// Stop streaming. Returns once no driver thread will deliver another frame.
    fn stop(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

pub trait Driver {
    fn enumerate_devices(&self) -> usize;

    fn device_serial_number(&self, index: usize) -> Option<String>;

    fn open_device(&self, index: usize, pipeline: PacketPipeline) -> Result<Box<dyn Device>>;

    fn open_default_device(&self, pipeline: PacketPipeline) -> Result<Box<dyn Device>> {
        if self.enumerate_devices() == 0 {
            return Err(Error::DeviceFailure("no device connected".into()));
        }
        self.open_device(0, pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_names_parse_with_optional_device() {
        assert_eq!("cpu".parse(), Ok(PacketPipeline::Cpu));
        assert_eq!("OpenGL".parse(), Ok(PacketPipeline::OpenGl));
        assert_eq!("opencl".parse(), Ok(PacketPipeline::OpenCl { device: None }));
        assert_eq!("opencl:1".parse(), Ok(PacketPipeline::OpenCl { device: Some(1) }));
        assert_eq!("cuda: 0".parse(), Ok(PacketPipeline::Cuda { device: Some(0) }));
        assert!("cpu:1".parse::<PacketPipeline>().is_err());
        assert!("opencl:-1".parse::<PacketPipeline>().is_err());
        assert!("vulkan".parse::<PacketPipeline>().is_err());
    }

    #[test]
    fn pipeline_config_string_round_trips() {
        for pipeline in [
            PacketPipeline::Cpu,
            PacketPipeline::OpenGl,
            PacketPipeline::OpenCl { device: None },
            PacketPipeline::OpenCl { device: Some(2) },
            PacketPipeline::Cuda { device: Some(0) },
        ] {
            let text = String::from(pipeline);
            assert_eq!(text.parse(), Ok(pipeline), "{text}");
        }
        assert_eq!(PacketPipeline::OpenCl { device: Some(1) }.to_string(), "OpenCL (device 1)");
        assert_eq!(PacketPipeline::Cuda { device: None }.to_string(), "CUDA");
    }
}
