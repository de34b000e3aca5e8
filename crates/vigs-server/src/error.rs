use vigs_protocol::vigs::vigs_cmd::{VigsDecodeError, VigsSurfaceId};

use crate::backend::BackendError;
use crate::memory::GuestMemoryError;

/// Failure of one server operation.
///
/// None of these reach the guest; the dispatcher logs them and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("not initialized")]
    NotInitialized,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("surface {0} not found")]
    SurfaceNotFound(VigsSurfaceId),
    #[error("surface {0} already exists")]
    DuplicateSurface(VigsSurfaceId),
    #[error("surface bpp {surface} doesn't match display bpp {display}")]
    BppMismatch { surface: u32, display: u32 },
    #[error("plane {0} out of range")]
    PlaneOutOfRange(u32),
    #[error("bad plane format {0}")]
    BadPlaneFormat(u32),
    #[error("bad rotation {0}")]
    BadRotation(u32),
    #[error("bad surface format {0}")]
    BadSurfaceFormat(u32),
    #[error("protocol version mismatch: host {expected}, guest {actual}")]
    ProtocolVersion { expected: u32, actual: u32 },
    #[error("GL backend selected but no GL context supplied")]
    GlContextRequired,
    #[error("scanout source out of range: offset {offset:#x}, stride {stride}")]
    ScanoutOutOfRange { offset: u32, stride: u32 },
    #[error("display buffer too small: need {needed} bytes, have {found}")]
    DisplayTooSmall { needed: usize, found: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error(transparent)]
    Decode(#[from] VigsDecodeError),
    #[error("failed to spawn work queue thread: {0}")]
    Spawn(#[from] std::io::Error),
}
