use crate::capture::frame::{FrameType, FrameTypeMask};
use crate::error::Result;
use crate::pipeline::convert::{FrameConverter, ImageArray};
use crate::pipeline::frame_set::FrameSet;
use crate::CaptureConfig;

/// Preallocated destinations for the allocation-free capture loop
#[derive(Debug, Clone)]
pub struct CaptureBuffers {
    color: Option<ImageArray<u8>>,
    ir: Option<ImageArray<f32>>,
    depth: Option<ImageArray<f32>>,
}

impl CaptureBuffers {
    /// One buffer per category in `mask`, shaped for `converter` and the configured geometry.
    pub fn new(mask: FrameTypeMask, converter: &FrameConverter, geometry: &CaptureConfig) -> Self {
        let layout = |kind: FrameType| {
            let (width, height) = match kind {
                FrameType::Color => (geometry.color_width, geometry.color_height),
                FrameType::Ir | FrameType::Depth => (geometry.depth_width, geometry.depth_height),
            };
            converter.output_layout(kind, width, height).shape
        };

        Self {
            color: mask
                .contains(FrameType::Color)
                .then(|| ImageArray::zeros(layout(FrameType::Color))),
            ir: mask
                .contains(FrameType::Ir)
                .then(|| ImageArray::zeros(layout(FrameType::Ir))),
            depth: mask
                .contains(FrameType::Depth)
                .then(|| ImageArray::zeros(layout(FrameType::Depth))),
        }
    }

    /// Wrap caller-owned arrays.
    pub fn from_parts(
        color: Option<ImageArray<u8>>,
        ir: Option<ImageArray<f32>>,
        depth: Option<ImageArray<f32>>,
    ) -> Self {
        Self { color, ir, depth }
    }

    pub fn color(&self) -> Option<&ImageArray<u8>> {
        self.color.as_ref()
    }

    pub fn ir(&self) -> Option<&ImageArray<f32>> {
        self.ir.as_ref()
    }

    pub fn depth(&self) -> Option<&ImageArray<f32>> {
        self.depth.as_ref()
    }

    pub fn mask(&self) -> FrameTypeMask {
        let mut mask = FrameTypeMask::EMPTY;
        if self.color.is_some() {
            mask.insert(FrameType::Color);
        }
        if self.ir.is_some() {
            mask.insert(FrameType::Ir);
        }
        if self.depth.is_some() {
            mask.insert(FrameType::Depth);
        }
        mask
    }

    /// Convert every frame that has a buffer. Every buffer is validated
    /// before the first write, so a mismatch leaves all of them untouched.
    pub fn fill(&mut self, converter: &FrameConverter, set: &FrameSet) -> Result<()> {
        let color = match &self.color {
            Some(dst) => {
                let frame = set.frame(FrameType::Color)?;
                Some((frame.format(), converter.check_into(frame, dst)?))
            }
            None => None,
        };
        let ir = match &self.ir {
            Some(dst) => {
                let frame = set.frame(FrameType::Ir)?;
                Some((frame.format(), converter.check_into(frame, dst)?))
            }
            None => None,
        };
        let depth = match &self.depth {
            Some(dst) => {
                let frame = set.frame(FrameType::Depth)?;
                Some((frame.format(), converter.check_into(frame, dst)?))
            }
            None => None,
        };

        if let (Some(dst), Some((format, raw))) = (self.color.as_mut(), color) {
            converter.write(format, raw, dst.as_bytes_mut());
        }
        if let (Some(dst), Some((format, raw))) = (self.ir.as_mut(), ir) {
            converter.write(format, raw, dst.as_bytes_mut());
        }
        if let (Some(dst), Some((format, raw))) = (self.depth.as_mut(), depth) {
            converter.write(format, raw, dst.as_bytes_mut());
        }
        Ok(())
    }
}
