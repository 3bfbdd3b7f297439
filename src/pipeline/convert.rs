//! Frame to array conversion.
//!
//! Two explicit entry points: [`FrameConverter::to_array`] allocates the
//! output, [`FrameConverter::to_array_into`] writes into a caller buffer and
//! never allocates. Both go through the same byte writer so their output is
//! bit-identical.
//!
//! Layouts:
//! * depth and ir: one native-endian `f32` per pixel, no scaling, shape
//!   `(height, width, 1)`;
//! * color, [`ColorOrder::Native`]: the 4 driver channels verbatim, shape
//!   `(height, width, 4)`;
//! * color, [`ColorOrder::Rgb`]: padding dropped and channels emitted as
//!   red, green, blue regardless of the driver order, shape `(height, width, 3)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{Frame, FrameType, PixelFormat};
use crate::error::{Result, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Shape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of elements, saturating at `usize::MAX`
    pub const fn len(&self) -> usize {
        self.height.saturating_mul(self.width).saturating_mul(self.channels)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.height, self.width, self.channels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    F32,
}

/// Element types a frame converts to
pub trait Element: bytemuck::Pod + Default + PartialEq + fmt::Debug {
    const DTYPE: DType;
}

impl Element for u8 {
    const DTYPE: DType = DType::U8;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

/// Dense row-major `(height, width, channels)` array
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: Element> ImageArray<T> {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![T::default(); shape.len()],
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize, channel: usize) -> Option<T> {
        let Shape {
            height,
            width,
            channels,
        } = self.shape;
        if row >= height || col >= width || channel >= channels {
            return None;
        }
        self.data.get((row * width + col) * channels + channel).copied()
    }

    /// All channels of one pixel
    pub fn pixel(&self, row: usize, col: usize) -> Option<&[T]> {
        let Shape { height, width, channels } = self.shape;
        if row >= height || col >= width {
            return None;
        }
        let start = (row * width + col) * channels;
        self.data.get(start..start + channels)
    }

    pub fn row(&self, row: usize) -> Option<&[T]> {
        let stride = self.shape.width * self.shape.channels;
        (row < self.shape.height).then(|| &self.data[row * stride..(row + 1) * stride])
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.data.as_mut_slice())
    }
}

/// Result of the allocating path
#[derive(Debug, Clone, PartialEq)]
pub enum FrameArray {
    Color(ImageArray<u8>),
    Float(ImageArray<f32>),
}

impl FrameArray {
    pub fn shape(&self) -> Shape {
        match self {
            FrameArray::Color(array) => array.shape(),
            FrameArray::Float(array) => array.shape(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            FrameArray::Color(_) => DType::U8,
            FrameArray::Float(_) => DType::F32,
        }
    }

    pub fn as_color(&self) -> Option<&ImageArray<u8>> {
        match self {
            FrameArray::Color(array) => Some(array),
            FrameArray::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<&ImageArray<f32>> {
        match self {
            FrameArray::Float(array) => Some(array),
            FrameArray::Color(_) => None,
        }
    }
}

/// Channel layout for converted color frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    /// 4 channels exactly as the driver delivered them
    #[default]
    Native,
    /// 3 channels, red first
    Rgb,
}

/// Expected output of converting one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub shape: Shape,
    pub dtype: DType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameConverter {
    color_order: ColorOrder,
}

impl FrameConverter {
    pub const fn new(color_order: ColorOrder) -> Self {
        Self { color_order }
    }

    pub fn color_order(&self) -> ColorOrder {
        self.color_order
    }

    /// Output layout for a frame of `kind` and the given geometry
    pub fn output_layout(&self, kind: FrameType, width: usize, height: usize) -> Layout {
        match kind {
            FrameType::Color => {
                let channels = match self.color_order {
                    ColorOrder::Native => 4,
                    ColorOrder::Rgb => 3,
                };
                Layout {
                    shape: Shape::new(height, width, channels),
                    dtype: DType::U8,
                }
            }
            FrameType::Ir | FrameType::Depth => Layout {
                shape: Shape::new(height, width, 1),
                dtype: DType::F32,
            },
        }
    }

    /// Output layout for `frame`, rejecting frames whose format does not fit their kind.
    pub fn layout(&self, frame: &Frame) -> Result<Layout> {
        let kind = frame.kind();
        let format_fits = match kind {
            FrameType::Color => matches!(frame.format(), PixelFormat::Bgrx | PixelFormat::Rgbx),
            FrameType::Ir | FrameType::Depth => frame.format() == PixelFormat::Float,
        };
        if !format_fits {
            return Err(Violation::UnsupportedFormat {
                kind,
                reason: format!("{:?} pixels", frame.format()),
            }
            .into());
        }
        if frame.bytes_per_pixel() != 4 {
            return Err(Violation::UnsupportedFormat {
                kind,
                reason: format!("{} bytes per pixel", frame.bytes_per_pixel()),
            }
            .into());
        }
        Ok(self.output_layout(kind, frame.width(), frame.height()))
    }

    /// Convert into freshly allocated storage.
    pub fn to_array(&self, frame: &Frame) -> Result<FrameArray> {
        let layout = self.layout(frame)?;
        let raw = source_bytes(frame)?;
        match frame.kind() {
            FrameType::Color => {
                let mut out = ImageArray::<u8>::zeros(layout.shape);
                self.write(frame.format(), raw, out.as_bytes_mut());
                Ok(FrameArray::Color(out))
            }
            FrameType::Ir | FrameType::Depth => {
                let mut out = ImageArray::<f32>::zeros(layout.shape);
                self.write(frame.format(), raw, out.as_bytes_mut());
                Ok(FrameArray::Float(out))
            }
        }
    }

    /// Convert into `dst` without allocating. On error `dst` is untouched.
    pub fn to_array_into<'a, T: Element>(
        &self,
        frame: &Frame,
        dst: &'a mut ImageArray<T>,
    ) -> Result<&'a ImageArray<T>> {
        let raw = self.check_into(frame, dst)?;
        self.write(frame.format(), raw, dst.as_bytes_mut());
        Ok(dst)
    }

    /// Validate `dst` against `frame` and return the readable source bytes.
    pub(crate) fn check_into<'f, T: Element>(
        &self,
        frame: &'f Frame,
        dst: &ImageArray<T>,
    ) -> Result<&'f [u8]> {
        let layout = self.layout(frame)?;
        if T::DTYPE != layout.dtype {
            return Err(Violation::DtypeMismatch {
                expected: layout.dtype,
                found: T::DTYPE,
            }
            .into());
        }
        if dst.shape() != layout.shape {
            return Err(Violation::ShapeMismatch {
                expected: layout.shape,
                found: dst.shape(),
            }
            .into());
        }
        source_bytes(frame)
    }

    /// Write converted bytes; `out` is already sized for the layout.
    pub(crate) fn write(&self, format: PixelFormat, raw: &[u8], out: &mut [u8]) {
        match (format, self.color_order) {
            (PixelFormat::Float, _) | (_, ColorOrder::Native) => {
                out.copy_from_slice(&raw[..out.len()]);
            }
            (PixelFormat::Bgrx, ColorOrder::Rgb) => {
                for (src, dst) in raw.chunks_exact(4).zip(out.chunks_exact_mut(3)) {
                    dst[0] = src[2];
                    dst[1] = src[1];
                    dst[2] = src[0];
                }
            }
            (PixelFormat::Rgbx, ColorOrder::Rgb) => {
                for (src, dst) in raw.chunks_exact(4).zip(out.chunks_exact_mut(3)) {
                    dst.copy_from_slice(&src[..3]);
                }
            }
        }
    }
}

fn source_bytes(frame: &Frame) -> Result<&[u8]> {
    let raw = frame.data()?;
    let expected = frame.meta().byte_len()?;
    if raw.len() < expected {
        return Err(Violation::UnsupportedFormat {
            kind: frame.kind(),
            reason: format!("buffer holds {} bytes, expected {expected}", raw.len()),
        }
        .into());
    }
    Ok(raw)
}
