//! Host side of the VIGS virtual GPU.
//!
//! The guest driver writes command batches into shared RAM and rings a doorbell with the batch
//! offset. This crate turns those batches into operations on host surfaces and reports
//! completion back through fence sequence numbers.
//!
//! Layers, bottom up:
//! 1. **Shared memory** ([`memory`]): the RAM and VRAM-mirror regions the guest can see.
//! 2. **Backends** ([`backend`]): surface storage and pixel ops, either in CPU memory
//!    ([`backend::sw`]) or in GL textures ([`backend::gl`]).
//! 3. **Server** ([`server`]): surface table, root surface, planes, display capture, run on a
//!    single render thread ([`work_queue`]).
//! 4. **Dispatcher** ([`comm`]): decodes batches from RAM and calls into the server.
//! 5. **Host** ([`host`]): wires the above to a [`display::DisplaySink`] and tracks fence acks
//!    for the guest ([`fence`]).
#![forbid(unsafe_code)]

pub mod backend;
pub mod comm;
pub mod config;
pub mod display;
pub mod error;
pub mod fence;
pub mod host;
pub mod logging;
pub mod memory;
pub mod plane;
pub mod server;
pub mod stats;
pub mod surface;
pub mod work_queue;

pub use backend::{Backend, BackendError, SurfaceOps};
pub use config::{BackendKind, ConfigError, VigsConfig};
pub use display::{BufferDisplay, DisplaySink};
pub use error::ServerError;
pub use fence::FenceManager;
pub use host::{FenceNotifier, VigsHost};
pub use memory::{GuestMemory, GuestMemoryError, VecGuestMemory};
pub use plane::{Plane, PlaneInfo};
pub use server::{RootSurface, Server};
pub use stats::ServerStatsSnapshot;
pub use surface::{ResourceState, Surface, WinsysSurface};
