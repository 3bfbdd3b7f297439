use std::time::Duration;

use crate::capture::frame::{Frame, FrameMeta, FrameType, FrameTypeMask};
use crate::error::{Result, Violation};

/// Frames of one capture cycle, keyed by category
#[derive(Debug)]
pub struct FrameSet {
    sequence: u64,
    frames: [Option<Frame>; 3],
}

impl FrameSet {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            frames: [None, None, None],
        }
    }

    /// Capture cycle the set belongs to
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Store `frame` under its category, returning the frame it replaced.
    pub fn insert(&mut self, frame: Frame) -> Option<Frame> {
        self.frames[frame.kind().index()].replace(frame)
    }

    pub fn get(&self, kind: FrameType) -> Option<&Frame> {
        self.frames[kind.index()].as_ref()
    }

    pub fn frame(&self, kind: FrameType) -> Result<&Frame> {
        self.get(kind).ok_or_else(|| Violation::MissingFrame(kind).into())
    }

    pub fn color(&self) -> Option<&Frame> {
        self.get(FrameType::Color)
    }

    pub fn ir(&self) -> Option<&Frame> {
        self.get(FrameType::Ir)
    }

    pub fn depth(&self) -> Option<&Frame> {
        self.get(FrameType::Depth)
    }

    pub fn mask(&self) -> FrameTypeMask {
        self.iter()
            .fold(FrameTypeMask::EMPTY, |mask, frame| mask | frame.kind())
    }

    pub fn is_complete(&self, mask: FrameTypeMask) -> bool {
        mask.iter().all(|kind| self.frames[kind.index()].is_some())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().flatten()
    }

    pub fn info(&self) -> FrameSetInfo {
        FrameSetInfo {
            sequence: self.sequence,
            frames: FrameType::ALL.map(|kind| self.get(kind).map(|frame| *frame.meta())),
        }
    }

    pub(crate) fn into_frames(self) -> impl Iterator<Item = Frame> {
        self.frames.into_iter().flatten()
    }
}

/// Metadata of a frame set that outlives its release
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSetInfo {
    pub sequence: u64,
    frames: [Option<FrameMeta>; 3],
}

impl FrameSetInfo {
    pub fn meta(&self, kind: FrameType) -> Option<&FrameMeta> {
        self.frames[kind.index()].as_ref()
    }

    /// Latest device timestamp across the set
    pub fn timestamp(&self) -> Option<Duration> {
        self.frames.iter().flatten().map(|meta| meta.timestamp).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    #[test]
    fn completeness_follows_mask() {
        let mut set = FrameSet::new(7);
        set.insert(Frame::zeroed(FrameType::Color, 1, 1, PixelFormat::Bgrx).unwrap().with_sequence(7, Duration::ZERO));
        assert!(set.is_complete(FrameType::Color.into()));
        assert!(!set.is_complete(FrameType::Color | FrameType::Depth));

        set.insert(Frame::zeroed(FrameType::Depth, 1, 1, PixelFormat::Float).unwrap().with_sequence(7, Duration::from_millis(3)));
        assert!(set.is_complete(FrameType::Color | FrameType::Depth));
        assert!(!set.is_complete(FrameTypeMask::ALL));
        assert_eq!(set.mask(), FrameType::Color | FrameType::Depth);
        assert_eq!(set.len(), 2);

        let info = set.info();
        assert_eq!(info.sequence, 7);
        assert!(info.meta(FrameType::Ir).is_none());
        assert_eq!(info.timestamp(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn missing_frame_is_a_violation() {
        let set = FrameSet::new(1);
        assert!(set.is_empty());
        assert!(matches!(
            set.frame(FrameType::Ir),
            Err(crate::Error::ContractViolation(Violation::MissingFrame(FrameType::Ir)))
        ));
    }
}
