//! Hardware overlay planes.
//!
//! A plane references up to [`VIGS_PLANE_SURFACES`] surfaces (one per YUV component) and
//! composites them onto the display with the given geometry. The compositor polls
//! [`Plane::is_dirty`] and acknowledges with [`Plane::reset_dirty`].

use std::sync::Arc;

use vigs_protocol::vigs::vigs_cmd::{
    VigsPlaneFormat, VigsRect, VigsRotation, VigsSize, VigsSurfaceId, VIGS_PLANE_SURFACES,
};

use crate::surface::SurfaceHandle;

#[derive(Clone, Debug, Default)]
pub struct Plane {
    pub surfaces: [Option<Arc<SurfaceHandle>>; VIGS_PLANE_SURFACES],
    pub width: u32,
    pub height: u32,
    pub format: VigsPlaneFormat,
    pub src_rect: VigsRect,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_size: VigsSize,
    pub z_pos: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub rotation: VigsRotation,
    dirty: bool,
}

/// Copyable view of a plane for the compositor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    pub surfaces: [Option<VigsSurfaceId>; VIGS_PLANE_SURFACES],
    pub width: u32,
    pub height: u32,
    pub format: VigsPlaneFormat,
    pub src_rect: VigsRect,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_size: VigsSize,
    pub z_pos: i32,
    pub hflip: bool,
    pub vflip: bool,
    pub rotation: VigsRotation,
}

impl Plane {
    /// A plane is shown while its first surface slot is bound.
    pub fn enabled(&self) -> bool {
        self.surfaces[0].is_some()
    }

    /// True if the plane's parameters changed or any bound surface was drawn to.
    pub fn is_dirty(&self) -> bool {
        self.dirty
            || self
                .surfaces
                .iter()
                .flatten()
                .any(|sfc| sfc.is_dirty())
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
        for sfc in self.surfaces.iter().flatten() {
            sfc.set_dirty(false);
        }
    }

    /// Unbinds a surface that is going away. The plane is disabled if any slot referenced it.
    pub fn detach_surface(&mut self, id: VigsSurfaceId) -> bool {
        let bound = self.surfaces.iter().flatten().any(|sfc| sfc.id() == id);
        if bound {
            self.surfaces = Default::default();
            self.dirty = true;
        }
        bound
    }

    pub fn info(&self) -> PlaneInfo {
        PlaneInfo {
            surfaces: std::array::from_fn(|i| self.surfaces[i].as_ref().map(|sfc| sfc.id())),
            width: self.width,
            height: self.height,
            format: self.format,
            src_rect: self.src_rect,
            dst_x: self.dst_x,
            dst_y: self.dst_y,
            dst_size: self.dst_size,
            z_pos: self.z_pos,
            hflip: self.hflip,
            vflip: self.vflip,
            rotation: self.rotation,
        }
    }
}
