pub mod driver;
pub mod frame;
pub mod pool;
pub mod synthetic;

pub use driver::{Device, Driver, FrameListener, PacketPipeline};
pub use frame::{Frame, FrameMeta, FrameType, FrameTypeMask, PixelFormat};
pub use pool::{FramePool, FrameWriter, PoolStats};
pub use synthetic::SyntheticDriver;
