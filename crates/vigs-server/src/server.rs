//! The VIGS server: surface table, root surface, planes and display capture.
//!
//! Control commands run on the dispatch thread after draining the render queue. Batches and
//! display captures run as jobs on the render queue, one at a time, in submission order.
//!
//! Locks: `state` guards everything the render thread mutates, `capture` guards the captured
//! frame and the capture fence. `capture` is never held while taking `state`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, trace, warn};
use vigs_protocol::vigs::vigs_cmd::{
    VigsCmdGaCopyRequest, VigsCmdSetPlaneRequest, VigsColor, VigsCopy, VigsFenceSeq,
    VigsPlaneFormat, VigsRect, VigsRotation, VigsSurfaceFormat, VigsSurfaceId, VIGS_MAX_PLANES,
    VIGS_PLANE_SURFACES,
};

use crate::backend::{zeroed_buffer, Backend, SurfaceLayout};
use crate::comm::{dispatch_batch, BatchOps, Comm, CommOps};
use crate::display::DisplaySink;
use crate::error::ServerError;
use crate::memory::GuestMemory;
use crate::plane::{Plane, PlaneInfo};
use crate::stats::{ServerStats, ServerStatsSnapshot};
use crate::surface::{Surface, WinsysSurface};
use crate::work_queue::WorkQueue;

/// The surface scanned out to the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootSurface {
    pub id: VigsSurfaceId,
    /// Where in VRAM the root surface is mirrored for capture.
    pub offset: u32,
    /// Recorded for the guest's benefit; capture always goes through VRAM.
    pub scanout: bool,
}

struct ServerState {
    backend: Box<dyn Backend>,
    surfaces: HashMap<VigsSurfaceId, Surface>,
    root: Option<RootSurface>,
    planes: [Plane; VIGS_MAX_PLANES],
    initialized: bool,
    vram: Arc<dyn GuestMemory>,
    display: Arc<dyn DisplaySink>,
    stats: Arc<ServerStats>,
}

#[derive(Debug)]
struct CapturedFrame {
    width: u32,
    height: u32,
    stride: u32,
    format: VigsSurfaceFormat,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct CaptureState {
    frame: Option<CapturedFrame>,
    is_capturing: bool,
    /// Fence parked by `set_root_surface` while a capture was in flight.
    fence_seq: VigsFenceSeq,
}

struct ServerShared {
    state: Mutex<ServerState>,
    capture: Mutex<CaptureState>,
    vram: Arc<dyn GuestMemory>,
    display: Arc<dyn DisplaySink>,
    stats: Arc<ServerStats>,
}

pub struct Server {
    shared: Arc<ServerShared>,
    queue: WorkQueue,
    comm: Comm,
}

fn ack_fence(display: &dyn DisplaySink, stats: &ServerStats, fence_seq: VigsFenceSeq) {
    if fence_seq != 0 {
        display.fence_ack(fence_seq);
        stats.inc_fence_acks();
    }
}

impl ServerState {
    fn require_initialized(&self) -> Result<(), ServerError> {
        if self.initialized {
            Ok(())
        } else {
            Err(ServerError::NotInitialized)
        }
    }

    fn surface_mut(&mut self, id: VigsSurfaceId) -> Result<&mut Surface, ServerError> {
        self.surfaces
            .get_mut(&id)
            .ok_or(ServerError::SurfaceNotFound(id))
    }

    fn report(&self, op: &'static str, result: Result<(), ServerError>) {
        let Err(err) = result else {
            return;
        };
        match &err {
            ServerError::SurfaceNotFound(_) => self.stats.inc_surfaces_not_found(),
            ServerError::Backend(_) => self.stats.inc_backend_errors(),
            _ => {}
        }
        error!(op, %err, "request failed");
    }

    /// Forgets `id` as root and unbinds it from the planes.
    fn unuse_surface(&mut self, id: VigsSurfaceId) {
        if self.root.is_some_and(|root| root.id == id) {
            trace!(id, "root surface reset");
            self.root = None;
        }
        for plane in &mut self.planes {
            plane.detach_surface(id);
        }
    }

    fn remove_surfaces_where<F>(&mut self, mut remove: F)
    where
        F: FnMut(&Surface) -> bool,
    {
        let ids: Vec<VigsSurfaceId> = self
            .surfaces
            .values()
            .filter(|sfc| remove(sfc))
            .map(Surface::id)
            .collect();
        for id in ids {
            self.unuse_surface(id);
            self.surfaces.remove(&id);
        }
    }

    /// Drops every surface inside a backend bracket and returns to the uninitialized state.
    fn reset_all(&mut self) {
        if let Err(err) = self.backend.batch_start() {
            error!(%err, "batch_start failed");
        }
        self.remove_surfaces_where(|_| true);
        self.backend.batch_end();
        self.initialized = false;
    }

    fn try_create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    ) -> Result<(), ServerError> {
        self.require_initialized()?;
        if self.surfaces.contains_key(&id) {
            return Err(ServerError::DuplicateSurface(id));
        }
        let sfc = self
            .backend
            .create_surface(width, height, stride, format, id)?;
        self.surfaces.insert(id, sfc);
        trace!(num_surfaces = self.surfaces.len());
        Ok(())
    }

    fn try_destroy_surface(&mut self, id: VigsSurfaceId) -> Result<(), ServerError> {
        self.require_initialized()?;
        if !self.surfaces.contains_key(&id) {
            return Err(ServerError::SurfaceNotFound(id));
        }
        self.unuse_surface(id);
        self.surfaces.remove(&id);
        trace!(num_surfaces = self.surfaces.len());
        Ok(())
    }

    fn try_update_vram(&mut self, sfc_id: VigsSurfaceId, offset: u32) -> Result<(), ServerError> {
        self.require_initialized()?;
        let vram = Arc::clone(&self.vram);
        let sfc = self.surface_mut(sfc_id)?;

        let mut buf = zeroed_buffer(sfc.data_size()?)?;
        sfc.read_all(&mut buf)?;
        vram.write(u64::from(offset), &buf)?;
        sfc.set_dirty(false);
        Ok(())
    }

    fn try_update_gpu(
        &mut self,
        sfc_id: VigsSurfaceId,
        offset: u32,
        entries: &[VigsRect],
    ) -> Result<(), ServerError> {
        self.require_initialized()?;
        let vram = Arc::clone(&self.vram);
        let sfc = self.surface_mut(sfc_id)?;

        let mut buf = zeroed_buffer(sfc.data_size()?)?;
        vram.read(u64::from(offset), &mut buf)?;
        sfc.draw_pixels(&buf, entries)?;
        sfc.set_dirty(true);
        Ok(())
    }

    fn try_copy(
        &mut self,
        src_id: VigsSurfaceId,
        dst_id: VigsSurfaceId,
        entries: &[VigsCopy],
    ) -> Result<(), ServerError> {
        self.require_initialized()?;
        if src_id == dst_id {
            let sfc = self.surface_mut(dst_id)?;
            sfc.copy_from(None, entries)?;
            sfc.set_dirty(true);
            return Ok(());
        }

        if !self.surfaces.contains_key(&src_id) {
            return Err(ServerError::SurfaceNotFound(src_id));
        }
        let mut dst = self
            .surfaces
            .remove(&dst_id)
            .ok_or(ServerError::SurfaceNotFound(dst_id))?;
        let res = dst.copy_from(self.surfaces.get(&src_id), entries);
        if res.is_ok() {
            dst.set_dirty(true);
        }
        self.surfaces.insert(dst_id, dst);
        Ok(res?)
    }

    fn try_solid_fill(
        &mut self,
        sfc_id: VigsSurfaceId,
        color: VigsColor,
        entries: &[VigsRect],
    ) -> Result<(), ServerError> {
        self.require_initialized()?;
        let sfc = self.surface_mut(sfc_id)?;
        sfc.solid_fill(color, entries)?;
        sfc.set_dirty(true);
        Ok(())
    }

    fn try_set_plane(&mut self, req: &VigsCmdSetPlaneRequest) -> Result<(), ServerError> {
        self.require_initialized()?;
        let req = *req;

        let index = req.plane;
        if index as usize >= VIGS_MAX_PLANES {
            return Err(ServerError::PlaneOutOfRange(index));
        }
        let format =
            VigsPlaneFormat::from_u32(req.format).ok_or(ServerError::BadPlaneFormat(req.format))?;
        let rotation =
            VigsRotation::from_u32(req.rotation).ok_or(ServerError::BadRotation(req.rotation))?;

        let ids = req.surfaces;
        let mut surfaces: [Option<_>; VIGS_PLANE_SURFACES] = Default::default();
        // A zero first slot disables the plane regardless of the rest.
        if ids[0] != 0 {
            for (slot, &id) in surfaces.iter_mut().zip(ids.iter()) {
                if id == 0 {
                    continue;
                }
                let sfc = self
                    .surfaces
                    .get(&id)
                    .ok_or(ServerError::SurfaceNotFound(id))?;
                *slot = Some(Arc::clone(sfc.handle()));
            }
        }

        let plane = &mut self.planes[index as usize];
        plane.surfaces = surfaces;
        plane.width = req.width;
        plane.height = req.height;
        plane.format = format;
        plane.src_rect = req.src_rect;
        plane.dst_x = req.dst_x;
        plane.dst_y = req.dst_y;
        plane.dst_size = req.dst_size;
        plane.z_pos = req.z_pos;
        plane.hflip = req.hflip != 0;
        plane.vflip = req.vflip != 0;
        plane.rotation = rotation;
        plane.set_dirty();
        Ok(())
    }

    fn try_ga_copy(&mut self, req: &VigsCmdGaCopyRequest) -> Result<(), ServerError> {
        self.require_initialized()?;
        let req = *req;
        let entry = req.entry;
        let (src_id, dst_id) = (req.src_id, req.dst_id);

        if req.src_scanout == 0 {
            return self.try_copy(src_id, dst_id, &[entry]);
        }

        // Source is a linear buffer in VRAM: stage it in the destination's layout and upload.
        let vram = Arc::clone(&self.vram);
        let dst = self.surface_mut(dst_id)?;
        let layout = SurfaceLayout::new(dst.width(), dst.height(), dst.stride(), dst.format())
            .map_err(ServerError::from)?;
        let dst_rect = VigsRect {
            pos: entry.to,
            size: entry.size,
        };
        let span = layout.span(dst_rect)?;

        let bpp = u64::from(layout.format.bpp());
        let from = entry.from;
        let mut staging = zeroed_buffer(layout.data_size())?;
        for row in 0..span.rows {
            let src_at = u64::from(from.y)
                .checked_add(row as u64)
                .and_then(|y| y.checked_mul(u64::from(req.src_stride)))
                .zip(u64::from(from.x).checked_mul(bpp))
                .and_then(|(y, x)| y.checked_add(x))
                .and_then(|at| at.checked_add(u64::from(req.src_offset)))
                .ok_or(ServerError::ScanoutOutOfRange {
                    offset: req.src_offset,
                    stride: req.src_stride,
                })?;
            let dst_at = span.row_offset(row);
            vram.read(src_at, &mut staging[dst_at..dst_at + span.row_bytes])?;
        }

        dst.draw_pixels(&staging, &[dst_rect])?;
        dst.set_dirty(true);
        Ok(())
    }

    fn try_set_root_surface(
        &mut self,
        id: VigsSurfaceId,
        scanout: bool,
        offset: u32,
    ) -> Result<(), ServerError> {
        self.require_initialized()?;
        if id == 0 {
            trace!("root surface reset");
            self.root = None;
            return Ok(());
        }
        if !self.surfaces.contains_key(&id) {
            return Err(ServerError::SurfaceNotFound(id));
        }
        self.root = Some(RootSurface {
            id,
            offset,
            scanout,
        });
        Ok(())
    }
}

impl BatchOps for ServerState {
    fn start(&mut self) {
        if let Err(err) = self.backend.batch_start() {
            error!(%err, backend = self.backend.name(), "batch_start failed");
        }
    }

    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    ) {
        let res = self.try_create_surface(width, height, stride, format, id);
        self.report("create_surface", res);
    }

    fn destroy_surface(&mut self, id: VigsSurfaceId) {
        let res = self.try_destroy_surface(id);
        self.report("destroy_surface", res);
    }

    fn update_vram(&mut self, sfc_id: VigsSurfaceId, offset: u32) {
        let res = self.try_update_vram(sfc_id, offset);
        self.report("update_vram", res);
    }

    fn update_gpu(&mut self, sfc_id: VigsSurfaceId, offset: u32, entries: &[VigsRect]) {
        let res = self.try_update_gpu(sfc_id, offset, entries);
        self.report("update_gpu", res);
    }

    fn copy(&mut self, src_id: VigsSurfaceId, dst_id: VigsSurfaceId, entries: &[VigsCopy]) {
        let res = self.try_copy(src_id, dst_id, entries);
        self.report("copy", res);
    }

    fn solid_fill(&mut self, sfc_id: VigsSurfaceId, color: VigsColor, entries: &[VigsRect]) {
        let res = self.try_solid_fill(sfc_id, color, entries);
        self.report("solid_fill", res);
    }

    fn set_plane(&mut self, req: &VigsCmdSetPlaneRequest) {
        let res = self.try_set_plane(req);
        self.report("set_plane", res);
    }

    fn ga_copy(&mut self, req: &VigsCmdGaCopyRequest) {
        let res = self.try_ga_copy(req);
        self.report("ga_copy", res);
    }

    fn end(&mut self, fence_seq: VigsFenceSeq) {
        self.backend.batch_end();
        ack_fence(&*self.display, &self.stats, fence_seq);
    }
}

/// Root surface geometry captured under the state lock.
struct CaptureSource {
    width: u32,
    height: u32,
    stride: u32,
    format: VigsSurfaceFormat,
    offset: u32,
}

impl ServerShared {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capture(&self) -> MutexGuard<'_, CaptureState> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ack(&self, fence_seq: VigsFenceSeq) {
        ack_fence(&*self.display, &self.stats, fence_seq);
    }

    fn run_batch(&self, data: &[u8]) {
        let mut state = self.state();
        let summary = dispatch_batch(data, &mut *state);
        self.stats.add_requests(summary.requests);
        self.stats.add_protocol_errors(summary.protocol_errors);
    }

    /// Mirrors a dirty root surface into VRAM and returns what to copy out of it.
    fn refresh_root(&self) -> Option<CaptureSource> {
        let mut guard = self.state();
        let state = &mut *guard;
        let root = state.root?;
        let Some(sfc) = state.surfaces.get_mut(&root.id) else {
            error!(id = root.id, "root surface missing");
            return None;
        };

        if sfc.is_dirty() {
            if let Err(err) = state.backend.batch_start() {
                error!(%err, "batch_start failed");
            }
            let res = sfc
                .data_size()
                .map_err(ServerError::from)
                .and_then(|len| {
                    let mut buf = zeroed_buffer(len)?;
                    sfc.read_all(&mut buf)?;
                    state.vram.write(u64::from(root.offset), &buf)?;
                    Ok(())
                });
            state.backend.batch_end();
            match res {
                Ok(()) => sfc.set_dirty(false),
                Err(err) => error!(%err, id = root.id, "root surface readback failed"),
            }
        }

        Some(CaptureSource {
            width: sfc.width(),
            height: sfc.height(),
            stride: sfc.stride(),
            format: sfc.format(),
            offset: root.offset,
        })
    }

    fn capture_job(&self) {
        let source = self.refresh_root();

        let fence_seq = {
            let mut capture = self.capture();
            if let Some(src) = source {
                let len = src.stride as usize * src.height as usize;
                let frame = match capture.frame.take() {
                    Some(frame) if frame.stride == src.stride && frame.height == src.height => {
                        Some(frame)
                    }
                    _ => match zeroed_buffer(len) {
                        Ok(data) => Some(CapturedFrame {
                            width: src.width,
                            height: src.height,
                            stride: src.stride,
                            format: src.format,
                            data,
                        }),
                        Err(err) => {
                            error!(%err, len, "capture buffer allocation failed");
                            None
                        }
                    },
                };
                if let Some(mut frame) = frame {
                    match self.vram.read(u64::from(src.offset), &mut frame.data) {
                        Ok(()) => {
                            frame.width = src.width;
                            frame.height = src.height;
                            frame.stride = src.stride;
                            frame.format = src.format;
                            self.stats.inc_captures();
                        }
                        Err(err) => error!(%err, "capture read failed"),
                    }
                    capture.frame = Some(frame);
                }
            }
            capture.is_capturing = false;
            std::mem::take(&mut capture.fence_seq)
        };

        self.ack(fence_seq);
    }
}

/// Copies the captured frame onto the display.
fn present(frame: &CapturedFrame, display: &dyn DisplaySink) -> Result<(), ServerError> {
    let sfc_bpp = frame.format.bpp();
    display.resize(frame.width, frame.height);
    let display_stride = display.stride() as usize;
    let display_bpp = display.bpp();

    if sfc_bpp != display_bpp {
        return Err(ServerError::BppMismatch {
            surface: sfc_bpp,
            display: display_bpp,
        });
    }

    let height = frame.height as usize;
    let stride = frame.stride as usize;
    let row_bytes = frame.width as usize * sfc_bpp as usize;
    let mut result = Ok(());

    display.with_data(&mut |data: &mut [u8]| {
        if height == 0 || stride == 0 || row_bytes == 0 {
            return;
        }
        if display_stride == stride {
            let len = height * stride;
            if data.len() < len || frame.data.len() < len {
                result = Err(ServerError::DisplayTooSmall {
                    needed: len,
                    found: data.len(),
                });
                return;
            }
            data[..len].copy_from_slice(&frame.data[..len]);
            return;
        }

        let needed = height.saturating_sub(1) * display_stride + row_bytes;
        if height > 0 && (data.len() < needed || display_stride < row_bytes) {
            result = Err(ServerError::DisplayTooSmall {
                needed,
                found: data.len(),
            });
            return;
        }
        for (row, src) in frame.data.chunks(stride).take(height).enumerate() {
            let dst = row * display_stride;
            data[dst..dst + row_bytes].copy_from_slice(&src[..row_bytes]);
        }
    });

    result
}

impl Server {
    pub fn new(
        backend: Box<dyn Backend>,
        vram: Arc<dyn GuestMemory>,
        ram: Arc<dyn GuestMemory>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<Self, ServerError> {
        let stats = Arc::new(ServerStats::new());
        debug!(backend = backend.name(), "creating server");

        let state = ServerState {
            backend,
            surfaces: HashMap::new(),
            root: None,
            planes: Default::default(),
            initialized: false,
            vram: Arc::clone(&vram),
            display: Arc::clone(&display),
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            shared: Arc::new(ServerShared {
                state: Mutex::new(state),
                capture: Mutex::new(CaptureState::default()),
                vram,
                display,
                stats,
            }),
            queue: WorkQueue::new("vigs-render")?,
            comm: Comm::new(ram),
        })
    }

    /// Entry point for a guest doorbell: handles the batch at `ram_offset` in RAM.
    pub fn dispatch(&self, ram_offset: u32) {
        if let Err(err) = self.comm.dispatch(ram_offset, self) {
            error!(ram_offset, %err, "dispatch failed");
            self.shared.stats.add_protocol_errors(1);
        }
    }

    /// Presents the last captured root surface frame and schedules the next capture.
    pub fn update_display(&self) -> Result<(), ServerError> {
        let mut capture = self.shared.capture();

        let result = match &capture.frame {
            Some(frame) => present(frame, &*self.shared.display),
            None => Ok(()),
        };

        if !capture.is_capturing {
            capture.is_capturing = true;
            let shared = Arc::clone(&self.shared);
            self.queue.add_item(move || shared.capture_job());
        }

        result
    }

    /// Blocks until all queued batches and captures have run.
    pub fn wait_idle(&self) {
        self.queue.wait();
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state().initialized
    }

    pub fn surface_count(&self) -> usize {
        self.shared.state().surfaces.len()
    }

    pub fn root_surface(&self) -> Option<RootSurface> {
        self.shared.state().root
    }

    pub fn root_surface_id(&self) -> Option<VigsSurfaceId> {
        self.root_surface().map(|root| root.id)
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.state().backend.name()
    }

    pub fn planes_snapshot(&self) -> [PlaneInfo; VIGS_MAX_PLANES] {
        let state = self.shared.state();
        std::array::from_fn(|i| state.planes[i].info())
    }

    /// Dirty planes with their index; each returned plane is marked clean.
    pub fn take_dirty_planes(&self) -> Vec<(usize, PlaneInfo)> {
        let mut state = self.shared.state();
        state
            .planes
            .iter_mut()
            .enumerate()
            .filter(|(_, plane)| plane.is_dirty())
            .map(|(i, plane)| {
                plane.reset_dirty();
                (i, plane.info())
            })
            .collect()
    }

    /// Strong handle to the resource behind surface `id`, for external viewers.
    pub fn acquire_surface(&self, id: VigsSurfaceId) -> Option<Arc<WinsysSurface>> {
        self.shared
            .state()
            .surfaces
            .get(&id)
            .map(|sfc| Arc::clone(sfc.winsys()))
    }

    /// Fence completion reported by a viewer.
    pub fn fence_ack(&self, fence_seq: VigsFenceSeq) {
        self.shared.ack(fence_seq);
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Server {
    /// Runs a control command once the render queue has drained.
    fn control<F>(&self, op: &'static str, f: F)
    where
        F: FnOnce(&mut ServerState) -> Result<(), ServerError>,
    {
        self.queue.wait();
        let mut state = self.shared.state();
        let res = f(&mut *state);
        state.report(op, res);
    }
}

impl CommOps for Server {
    fn init(&self) {
        self.control("init", |state| {
            if state.initialized {
                return Err(ServerError::AlreadyInitialized);
            }
            state.initialized = true;
            debug!(backend = state.backend.name(), "initialized");
            Ok(())
        });
    }

    fn reset(&self) {
        self.control("reset", |state| {
            state.require_initialized()?;
            let root = state.root.map(|root| root.id);
            state.remove_surfaces_where(|sfc| Some(sfc.id()) != root);
            debug!(num_surfaces = state.surfaces.len(), "reset");
            Ok(())
        });
    }

    fn exit(&self) {
        self.control("exit", |state| {
            state.require_initialized()?;
            state.reset_all();
            debug!("exit");
            Ok(())
        });
    }

    fn set_root_surface(
        &self,
        id: VigsSurfaceId,
        scanout: bool,
        offset: u32,
        fence_seq: VigsFenceSeq,
    ) {
        let shared = Arc::clone(&self.shared);
        self.queue.add_item(move || {
            let mut state = shared.state();
            let res = state.try_set_root_surface(id, scanout, offset);
            state.report("set_root_surface", res);
        });

        let ack = {
            let mut capture = self.shared.capture();
            if capture.is_capturing {
                std::mem::replace(&mut capture.fence_seq, fence_seq)
            } else {
                fence_seq
            }
        };
        self.shared.ack(ack);
    }

    fn batch(&self, data: Vec<u8>) {
        self.shared.stats.inc_batches();
        let shared = Arc::clone(&self.shared);
        self.queue.add_item(move || shared.run_batch(&data));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.queue.destroy();
        let mut state = self.shared.state();
        if !state.surfaces.is_empty() {
            warn!(num_surfaces = state.surfaces.len(), "releasing surfaces on shutdown");
        }
        state.reset_all();
    }
}
