//! Surfaces and the GPU resources behind them.
//!
//! A [`Surface`] lives in the server's table and owns its backend implementation. The backend
//! resource it draws into (a texture, a pixel buffer) is a [`WinsysSurface`], shared through
//! `Arc` with external viewers. The resource points back at its surface through a `Weak`
//! link, which is emptied when the surface is destroyed; the resource itself is torn down when
//! the last handle goes away.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use vigs_protocol::vigs::vigs_cmd::{VigsColor, VigsCopy, VigsRect, VigsSurfaceFormat, VigsSurfaceId};

use crate::backend::{BackendError, SurfaceOps};

/// Identity and dirty state of a surface, shared with planes and resource back-links.
#[derive(Debug)]
pub struct SurfaceHandle {
    id: VigsSurfaceId,
    dirty: AtomicBool,
}

impl SurfaceHandle {
    pub fn new(id: VigsSurfaceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> VigsSurfaceId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Live,
    /// The owning surface is gone; teardown happens when the last handle drops.
    PendingDestroy,
}

struct ResourceLink {
    parent: Weak<SurfaceHandle>,
    state: ResourceState,
}

/// Backend resource behind a surface.
pub struct WinsysSurface {
    width: u32,
    height: u32,
    link: Mutex<ResourceLink>,
    backing: Box<dyn Any + Send + Sync>,
}

impl fmt::Debug for WinsysSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinsysSurface")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WinsysSurface {
    pub fn new<T>(width: u32, height: u32, parent: &Arc<SurfaceHandle>, backing: T) -> Arc<Self>
    where
        T: Any + Send + Sync,
    {
        Arc::new(Self {
            width,
            height,
            link: Mutex::new(ResourceLink {
                parent: Arc::downgrade(parent),
                state: ResourceState::Live,
            }),
            backing: Box::new(backing),
        })
    }

    fn link(&self) -> MutexGuard<'_, ResourceLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn state(&self) -> ResourceState {
        self.link().state
    }

    /// The owning surface, if it still exists.
    pub fn parent(&self) -> Option<Arc<SurfaceHandle>> {
        self.link().parent.upgrade()
    }

    /// Marks the owning surface dirty; a no-op once orphaned.
    pub fn set_dirty(&self) {
        if let Some(parent) = self.parent() {
            parent.set_dirty(true);
        }
    }

    pub fn orphan(&self) {
        let mut link = self.link();
        link.parent = Weak::new();
        link.state = ResourceState::PendingDestroy;
    }

    /// Backend-specific payload, e.g. the GL texture holder.
    pub fn backing<T: Any>(&self) -> Option<&T> {
        self.backing.downcast_ref::<T>()
    }
}

/// One drawable buffer in the server's surface table.
pub struct Surface {
    handle: Arc<SurfaceHandle>,
    ws: Arc<WinsysSurface>,
    stride: u32,
    format: VigsSurfaceFormat,
    ops: Box<dyn SurfaceOps>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl Surface {
    pub fn new(
        handle: Arc<SurfaceHandle>,
        ws: Arc<WinsysSurface>,
        stride: u32,
        format: VigsSurfaceFormat,
        ops: Box<dyn SurfaceOps>,
    ) -> Self {
        Self {
            handle,
            ws,
            stride,
            format,
            ops,
        }
    }

    pub fn id(&self) -> VigsSurfaceId {
        self.handle.id()
    }

    pub fn width(&self) -> u32 {
        self.ws.width()
    }

    pub fn height(&self) -> u32 {
        self.ws.height()
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> VigsSurfaceFormat {
        self.format
    }

    /// `stride * height`, the size of a full-surface transfer.
    pub fn data_size(&self) -> Result<usize, BackendError> {
        usize::try_from(self.stride)
            .ok()
            .and_then(|stride| stride.checked_mul(self.height() as usize))
            .ok_or(BackendError::InvalidGeometry {
                width: self.width(),
                height: self.height(),
                stride: self.stride,
            })
    }

    pub fn handle(&self) -> &Arc<SurfaceHandle> {
        &self.handle
    }

    pub fn winsys(&self) -> &Arc<WinsysSurface> {
        &self.ws
    }

    pub fn is_dirty(&self) -> bool {
        self.handle.is_dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.handle.set_dirty(dirty);
    }

    /// Reads `rect` into `dst`, laid out with this surface's stride at the rect's own offsets.
    pub fn read_pixels(&mut self, rect: VigsRect, dst: &mut [u8]) -> Result<(), BackendError> {
        self.ops.read_pixels(rect, dst)
    }

    pub fn read_all(&mut self, dst: &mut [u8]) -> Result<(), BackendError> {
        let rect = VigsRect::new(0, 0, self.width(), self.height());
        self.ops.read_pixels(rect, dst)
    }

    /// Uploads the given rectangles from `src`, laid out like the surface itself.
    pub fn draw_pixels(&mut self, src: &[u8], rects: &[VigsRect]) -> Result<(), BackendError> {
        self.ops.draw_pixels(src, rects)
    }

    /// Copies regions into this surface. `src == None` copies within the surface.
    pub fn copy_from(
        &mut self,
        src: Option<&Surface>,
        entries: &[VigsCopy],
    ) -> Result<(), BackendError> {
        let src_ops = src.map(|s| &*s.ops);
        self.ops.copy(src_ops, entries)
    }

    pub fn solid_fill(&mut self, color: VigsColor, rects: &[VigsRect]) -> Result<(), BackendError> {
        self.ops.solid_fill(color, rects)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        self.ws.orphan();
    }
}
