pub mod buffers;
pub mod convert;
pub mod frame_set;
pub mod listener;

pub use buffers::CaptureBuffers;
pub use convert::{ColorOrder, DType, FrameArray, FrameConverter, ImageArray, Layout, Shape};
pub use frame_set::{FrameSet, FrameSetInfo};
pub use listener::{FrameSetGuard, ListenerStats, SyncMultiFrameListener};
