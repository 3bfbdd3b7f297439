use std::time::Duration;

use thiserror::Error;

use crate::capture::frame::{FrameType, FrameTypeMask};
use crate::pipeline::convert::{DType, Shape};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no complete frame set within {0:?}")]
    Timeout(Duration),
    #[error("contract violation: {0}")]
    ContractViolation(#[from] Violation),
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error("listener stopped")]
    Stopped,
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Caller-side misuse reported synchronously, never silently corrected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("destination shape {found} does not match frame output shape {expected}")]
    ShapeMismatch { expected: Shape, found: Shape },
    #[error("destination dtype {found:?} does not match frame output dtype {expected:?}")]
    DtypeMismatch { expected: DType, found: DType },
    #[error("unsupported {kind:?} frame: {reason}")]
    UnsupportedFormat { kind: FrameType, reason: String },
    #[error("{0:?} frame was read after release")]
    Released(FrameType),
    #[error("frame set has no {0:?} frame")]
    MissingFrame(FrameType),
    #[error("listener needs {0:?} frames the session does not route to it")]
    UnroutedStream(FrameTypeMask),
}

impl Error {
    /// Timeouts are the only failures a capture loop retries without intervention.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
