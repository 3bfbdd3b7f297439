use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::pool::PoolShared;
use crate::error::{Result, Violation};

/// Frame categories, numbered as the driver numbers them so masks compose with `|`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Color = 1,
    Ir = 2,
    Depth = 4,
}

impl FrameType {
    pub const ALL: [FrameType; 3] = [FrameType::Color, FrameType::Ir, FrameType::Depth];

    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Dense index for per-category tables
    pub const fn index(self) -> usize {
        match self {
            FrameType::Color => 0,
            FrameType::Ir => 1,
            FrameType::Depth => 2,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FrameType::Color => "color",
            FrameType::Ir => "ir",
            FrameType::Depth => "depth",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "color" | "rgb" => Ok(FrameType::Color),
            "ir" | "infrared" => Ok(FrameType::Ir),
            "depth" => Ok(FrameType::Depth),
            other => Err(format!("unknown frame type: {other}")),
        }
    }
}

/// Set of frame categories a listener subscribes to
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<FrameType>", into = "Vec<FrameType>")]
pub struct FrameTypeMask(u8);

impl FrameTypeMask {
    pub const EMPTY: FrameTypeMask = FrameTypeMask(0);
    pub const ALL: FrameTypeMask = FrameTypeMask(1 | 2 | 4);

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, kind: FrameType) -> bool {
        self.0 & kind.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_subset_of(self, other: FrameTypeMask) -> bool {
        self.difference(other).is_empty()
    }

    /// Categories in `self` but not in `other`
    pub const fn difference(self, other: FrameTypeMask) -> FrameTypeMask {
        FrameTypeMask(self.0 & !other.0)
    }

    pub fn insert(&mut self, kind: FrameType) {
        self.0 |= kind.bit();
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = FrameType> {
        FrameType::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl fmt::Debug for FrameTypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<&str> = self.iter().map(FrameType::name).collect();
        f.write_str(&names.join("|"))
    }
}

impl From<FrameType> for FrameTypeMask {
    fn from(kind: FrameType) -> Self {
        Self(kind.bit())
    }
}

impl From<Vec<FrameType>> for FrameTypeMask {
    fn from(kinds: Vec<FrameType>) -> Self {
        kinds.into_iter().fold(Self::EMPTY, |mask, kind| mask | kind)
    }
}

impl From<FrameTypeMask> for Vec<FrameType> {
    fn from(mask: FrameTypeMask) -> Self {
        mask.iter().collect()
    }
}

impl BitOr for FrameType {
    type Output = FrameTypeMask;

    fn bitor(self, rhs: FrameType) -> FrameTypeMask {
        FrameTypeMask(self.bit() | rhs.bit())
    }
}

impl BitOr<FrameType> for FrameTypeMask {
    type Output = FrameTypeMask;

    fn bitor(self, rhs: FrameType) -> FrameTypeMask {
        FrameTypeMask(self.0 | rhs.bit())
    }
}

impl BitOr for FrameTypeMask {
    type Output = FrameTypeMask;

    fn bitor(self, rhs: FrameTypeMask) -> FrameTypeMask {
        FrameTypeMask(self.0 | rhs.0)
    }
}

/// Raw layouts the driver delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit blue, green, red, padding
    Bgrx,
    /// 8-bit red, green, blue, padding
    Rgbx,
    /// Native-endian 32-bit float, one per pixel
    Float,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgrx | PixelFormat::Rgbx | PixelFormat::Float => 4,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub kind: FrameType,
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    pub format: PixelFormat,
    /// Capture cycle this frame belongs to
    pub sequence: u64,
    /// Device timestamp
    pub timestamp: Duration,
}

impl FrameMeta {
    pub fn new(kind: FrameType, width: usize, height: usize, format: PixelFormat) -> Self {
        Self {
            kind,
            width,
            height,
            bytes_per_pixel: format.bytes_per_pixel(),
            format,
            sequence: 0,
            timestamp: Duration::ZERO,
        }
    }

    /// Payload size; geometry too large to address is an unsupported format.
    pub fn byte_len(&self) -> Result<usize> {
        self.width
            .checked_mul(self.height)
            .and_then(|pixels| pixels.checked_mul(self.bytes_per_pixel))
            .ok_or_else(|| {
                Violation::UnsupportedFormat {
                    kind: self.kind,
                    reason: format!(
                        "{}x{} at {} bytes per pixel overflows the address space",
                        self.width, self.height, self.bytes_per_pixel
                    ),
                }
                .into()
            })
    }
}

/// Readable window of a frame. Release bumps the shared generation, which
/// invalidates every handle issued under the previous one.
#[derive(Clone)]
pub(crate) struct Lease {
    generation: Arc<AtomicU64>,
    issued: u64,
    origin: Option<(Arc<PoolShared>, usize)>,
}

impl Lease {
    pub(crate) fn pooled(generation: Arc<AtomicU64>, pool: Arc<PoolShared>, index: usize) -> Self {
        let issued = generation.load(Ordering::Acquire);
        Self {
            generation,
            issued,
            origin: Some((pool, index)),
        }
    }

    fn detached() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            issued: 0,
            origin: None,
        }
    }

    fn is_valid(&self) -> bool {
        self.generation.load(Ordering::Acquire) == self.issued
    }
}

/// Frame handle with zero-copy semantics.
///
/// The payload is owned by the driver pool; cloning a frame clones the
/// handle, not the pixels. Once the frame set it came in is released every
/// clone reads as [`Violation::Released`].
#[derive(Clone)]
pub struct Frame {
    meta: FrameMeta,
    data: Bytes,
    lease: Lease,
}

impl Frame {
    pub(crate) fn from_parts(meta: FrameMeta, data: Bytes, lease: Lease) -> Self {
        Self { meta, data, lease }
    }

    /// Build a frame outside any driver pool, e.g. for tests or offline data.
    pub fn new(
        kind: FrameType,
        width: usize,
        height: usize,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let meta = FrameMeta::new(kind, width, height, format);
        let expected = meta.byte_len()?;
        let data = data.into();
        if data.len() != expected {
            return Err(Violation::UnsupportedFormat {
                kind,
                reason: format!(
                    "{}x{} {:?} needs {} bytes, got {}",
                    width,
                    height,
                    format,
                    expected,
                    data.len()
                ),
            }
            .into());
        }
        Ok(Self {
            meta,
            data,
            lease: Lease::detached(),
        })
    }

    /// Zero-filled frame of the given geometry.
    pub fn zeroed(kind: FrameType, width: usize, height: usize, format: PixelFormat) -> Result<Self> {
        let meta = FrameMeta::new(kind, width, height, format);
        Ok(Self {
            data: Bytes::from(vec![0u8; meta.byte_len()?]),
            meta,
            lease: Lease::detached(),
        })
    }

    /// Float frame from per-pixel values, row-major.
    pub fn from_f32(kind: FrameType, width: usize, height: usize, values: &[f32]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        Self::new(kind, width, height, PixelFormat::Float, bytes.to_vec())
    }

    pub fn with_sequence(mut self, sequence: u64, timestamp: Duration) -> Self {
        self.meta.sequence = sequence;
        self.meta.timestamp = timestamp;
        self
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn kind(&self) -> FrameType {
        self.meta.kind
    }

    pub fn width(&self) -> usize {
        self.meta.width
    }

    pub fn height(&self) -> usize {
        self.meta.height
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.meta.bytes_per_pixel
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.meta.timestamp
    }

    pub fn is_valid(&self) -> bool {
        self.lease.is_valid()
    }

    /// Raw bytes, rejected once the frame has been released.
    pub fn data(&self) -> Result<&[u8]> {
        if !self.lease.is_valid() {
            return Err(Violation::Released(self.meta.kind).into());
        }
        Ok(&self.data)
    }

    /// Hand the storage back to its pool. Returns false if this handle had
    /// already been invalidated.
    pub(crate) fn release(self) -> bool {
        let Frame { data, lease, .. } = self;
        let next = lease.issued.wrapping_add(1);
        if lease
            .generation
            .compare_exchange(lease.issued, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some((pool, index)) = lease.origin {
            pool.reclaim(index, data);
        }
        true
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .field("valid", &self.is_valid())
            .finish()
    }
}
