//! OpenGL backend.
//!
//! The platform layer (GLX, EGL, WGL, ...) is abstracted by [`GlContext`]: it owns the actual GL
//! context plus a second one for readback on viewer threads, and exposes the handful of texture
//! operations this backend needs. Surface pixels live in a texture that is created on first use
//! and owned by a [`GlWinsysTexture`], which viewers can keep alive past the surface.
//!
//! Every surface operation expects the context to be current, i.e. to run between
//! [`Backend::batch_start`] and [`Backend::batch_end`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace};
use vigs_protocol::vigs::vigs_cmd::{
    VigsColor, VigsCopy, VigsRect, VigsSurfaceFormat, VigsSurfaceId,
};

use super::pool::{PoolLease, ResourcePool};
use super::{zeroed_buffer, Backend, BackendError, RectSpan, SurfaceLayout, SurfaceOps};
use crate::surface::{Surface, SurfaceHandle, WinsysSurface};

pub const GL_EXT_TEXTURE_NPOT: &str = "GL_ARB_texture_non_power_of_two";

/// Texture name as returned by the platform layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlTexture(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Translates a guest `0xAARRGGBB` color. Surfaces without alpha are drawn opaque.
pub fn gl_color(format: VigsSurfaceFormat, color: VigsColor) -> GlColor {
    GlColor {
        r: (color >> 16) as u8,
        g: (color >> 8) as u8,
        b: color as u8,
        a: if format.has_alpha() {
            (color >> 24) as u8
        } else {
            0xFF
        },
    }
}

/// Platform GL context.
///
/// Pixel buffers are tightly packed BGRA rows covering exactly the given rectangle.
pub trait GlContext: Send + Sync + 'static {
    fn has_current(&self) -> bool;

    /// Binds (`true`) or releases (`false`) the rendering context on the calling thread.
    fn make_current(&self, enable: bool) -> bool;

    /// Same, for the readback context used by viewers outside batches.
    fn read_pixels_make_current(&self, enable: bool) -> bool;

    fn has_extension(&self, name: &str) -> bool;

    fn gen_texture(&self, width: u32, height: u32) -> Option<GlTexture>;
    fn delete_texture(&self, tex: GlTexture);

    fn tex_sub_image(&self, tex: GlTexture, rect: VigsRect, src: &[u8]);
    fn read_tex_image(&self, tex: GlTexture, rect: VigsRect, dst: &mut [u8]);

    /// Renders each `from` rectangle of `src` to the `to` position of `dst`. All entries read
    /// the source as it was before the call.
    fn copy_quads(&self, src: GlTexture, dst: GlTexture, entries: &[VigsCopy]);

    fn fill_rects(&self, tex: GlTexture, rects: &[VigsRect], color: GlColor);

    fn finish(&self);
}

/// Lazily created texture, shared by a surface and its viewers.
pub struct GlWinsysTexture<C: GlContext> {
    ctx: Arc<C>,
    width: u32,
    height: u32,
    tex: Mutex<Option<GlTexture>>,
}

impl<C: GlContext> fmt::Debug for GlWinsysTexture<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlWinsysTexture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tex", &self.created())
            .finish()
    }
}

impl<C: GlContext> GlWinsysTexture<C> {
    pub fn new(ctx: Arc<C>, width: u32, height: u32) -> Self {
        Self {
            ctx,
            width,
            height,
            tex: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<GlTexture>> {
        self.tex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The texture, if it has been created yet.
    pub fn created(&self) -> Option<GlTexture> {
        *self.slot()
    }

    /// The texture for a viewer, created on demand. Binds the context around creation unless
    /// the caller already has it current.
    pub fn texture(&self) -> Result<GlTexture, BackendError> {
        if self.ctx.has_current() {
            return self.ensure();
        }
        if !self.ctx.make_current(true) {
            return Err(BackendError::MakeCurrentFailed);
        }
        let tex = self.ensure();
        self.ctx.make_current(false);
        tex
    }

    /// Requires a current context.
    fn ensure(&self) -> Result<GlTexture, BackendError> {
        let mut slot = self.slot();
        if let Some(tex) = *slot {
            return Ok(tex);
        }
        let tex = self
            .ctx
            .gen_texture(self.width, self.height)
            .ok_or(BackendError::AllocationFailed("texture"))?;
        trace!(tex = tex.0, width = self.width, height = self.height, "texture created");
        *slot = Some(tex);
        Ok(tex)
    }

    /// Reads the whole texture from a viewer thread, using the readback context.
    ///
    /// A texture that was never drawn to reads as nothing and leaves `dst` untouched.
    pub fn read_pixels(&self, dst: &mut [u8]) -> Result<(), BackendError> {
        let needed = self.width as usize * self.height as usize * 4;
        if dst.len() < needed {
            return Err(BackendError::BufferTooSmall {
                needed,
                found: dst.len(),
            });
        }
        let Some(tex) = self.created() else {
            return Ok(());
        };

        if !self.ctx.read_pixels_make_current(true) {
            return Err(BackendError::MakeCurrentFailed);
        }
        self.ctx.read_tex_image(
            tex,
            VigsRect::new(0, 0, self.width, self.height),
            &mut dst[..needed],
        );
        self.ctx.read_pixels_make_current(false);
        Ok(())
    }
}

impl<C: GlContext> Drop for GlWinsysTexture<C> {
    fn drop(&mut self) {
        let Some(tex) = self.slot().take() else {
            return;
        };

        // The last reference can go away on any thread, inside or outside a batch.
        if self.ctx.has_current() {
            self.ctx.delete_texture(tex);
        } else if self.ctx.make_current(true) {
            self.ctx.delete_texture(tex);
            self.ctx.make_current(false);
        } else {
            error!(tex = tex.0, "texture leaked, make_current failed");
        }
    }
}

type TmpKey = (u32, u32, VigsSurfaceFormat);

pub struct GlBackend<C: GlContext> {
    ctx: Arc<C>,
    tmp_pool: Arc<ResourcePool<TmpKey, GlWinsysTexture<C>>>,
}

impl<C: GlContext> GlBackend<C> {
    /// Checks the context is usable for surface rendering.
    pub fn new(ctx: Arc<C>) -> Result<Self, BackendError> {
        if !ctx.make_current(true) {
            return Err(BackendError::MakeCurrentFailed);
        }
        let npot = ctx.has_extension(GL_EXT_TEXTURE_NPOT);
        ctx.make_current(false);

        if !npot {
            error!("OpenGL context lacks {GL_EXT_TEXTURE_NPOT}");
            return Err(BackendError::MissingExtension(GL_EXT_TEXTURE_NPOT));
        }

        Ok(Self {
            ctx,
            tmp_pool: Arc::new(ResourcePool::new()),
        })
    }

    pub fn context(&self) -> &Arc<C> {
        &self.ctx
    }
}

impl<C: GlContext> Backend for GlBackend<C> {
    fn name(&self) -> &'static str {
        "gl"
    }

    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    ) -> Result<Surface, BackendError> {
        let layout = SurfaceLayout::new(width, height, stride, format)?;
        if stride != width * format.bpp() {
            return Err(BackendError::UnsupportedStride { width, stride });
        }

        let tex = Arc::new(GlWinsysTexture::new(Arc::clone(&self.ctx), width, height));
        let handle = SurfaceHandle::new(id);
        let ws = WinsysSurface::new(width, height, &handle, Arc::clone(&tex));
        let ops = GlSurface {
            layout,
            ctx: Arc::clone(&self.ctx),
            tex,
            tmp_pool: Arc::clone(&self.tmp_pool),
            tmp: None,
        };
        Ok(Surface::new(handle, ws, stride, format, Box::new(ops)))
    }

    fn batch_start(&mut self) -> Result<(), BackendError> {
        if !self.ctx.make_current(true) {
            return Err(BackendError::MakeCurrentFailed);
        }
        Ok(())
    }

    fn batch_end(&mut self) {
        self.ctx.finish();
        self.ctx.make_current(false);
    }
}

pub struct GlSurface<C: GlContext> {
    layout: SurfaceLayout,
    ctx: Arc<C>,
    tex: Arc<GlWinsysTexture<C>>,
    tmp_pool: Arc<ResourcePool<TmpKey, GlWinsysTexture<C>>>,
    tmp: Option<PoolLease<TmpKey, GlWinsysTexture<C>>>,
}

impl<C: GlContext> GlSurface<C> {
    fn current(&self) -> Result<(), BackendError> {
        if self.ctx.has_current() {
            Ok(())
        } else {
            Err(BackendError::NotCurrent)
        }
    }

    fn tmp_texture(&mut self) -> Result<GlTexture, BackendError> {
        if self.tmp.is_none() {
            let key = (self.layout.width, self.layout.height, self.layout.format);
            let ctx = Arc::clone(&self.ctx);
            let (width, height) = (self.layout.width, self.layout.height);
            let lease = self.tmp_pool.acquire(key, || {
                Ok::<_, BackendError>(GlWinsysTexture::new(ctx, width, height))
            })?;
            self.tmp = Some(lease);
        }
        match &self.tmp {
            Some(lease) => lease.get().ensure(),
            None => Err(BackendError::AllocationFailed("temporary texture")),
        }
    }

    fn check_entries(
        src: &SurfaceLayout,
        dst: &SurfaceLayout,
        entries: &[VigsCopy],
    ) -> Result<(), BackendError> {
        for entry in entries {
            let VigsCopy { from, to, size } = *entry;
            src.span(VigsRect { pos: from, size })?;
            dst.span(VigsRect { pos: to, size })?;
        }
        Ok(())
    }
}

fn pack_rows(src: &[u8], span: &RectSpan) -> Vec<u8> {
    let mut out = Vec::with_capacity(span.row_bytes * span.rows);
    for row in 0..span.rows {
        let off = span.row_offset(row);
        out.extend_from_slice(&src[off..off + span.row_bytes]);
    }
    out
}

fn unpack_rows(packed: &[u8], span: &RectSpan, dst: &mut [u8]) {
    for (row, chunk) in packed.chunks_exact(span.row_bytes.max(1)).enumerate() {
        let off = span.row_offset(row);
        dst[off..off + span.row_bytes].copy_from_slice(chunk);
    }
}

impl<C: GlContext> SurfaceOps for GlSurface<C> {
    fn read_pixels(&mut self, rect: VigsRect, dst: &mut [u8]) -> Result<(), BackendError> {
        self.current()?;
        let span = self.layout.span(rect)?;
        SurfaceLayout::check_buffer(&span, dst.len())?;
        if span.rows == 0 || span.row_bytes == 0 {
            return Ok(());
        }

        let tex = self.tex.ensure()?;
        let mut packed = zeroed_buffer(span.row_bytes * span.rows)?;
        self.ctx.read_tex_image(tex, rect, &mut packed);
        unpack_rows(&packed, &span, dst);
        Ok(())
    }

    fn draw_pixels(&mut self, src: &[u8], rects: &[VigsRect]) -> Result<(), BackendError> {
        self.current()?;
        let tex = self.tex.ensure()?;
        for rect in rects {
            let span = self.layout.span(*rect)?;
            SurfaceLayout::check_buffer(&span, src.len())?;
            if span.rows == 0 || span.row_bytes == 0 {
                continue;
            }
            self.ctx.tex_sub_image(tex, *rect, &pack_rows(src, &span));
        }
        Ok(())
    }

    fn copy(
        &mut self,
        src: Option<&dyn SurfaceOps>,
        entries: &[VigsCopy],
    ) -> Result<(), BackendError> {
        self.current()?;

        let Some(src) = src else {
            Self::check_entries(&self.layout, &self.layout, entries)?;
            let tex = self.tex.ensure()?;
            let tmp = self.tmp_texture()?;

            // Render into the scratch texture, then back: GL can't sample and draw the same
            // texture in one pass.
            let full = self.layout.full_rect();
            let identity = VigsCopy {
                from: full.pos,
                to: full.pos,
                size: full.size,
            };
            let mut quads = Vec::with_capacity(entries.len() + 1);
            quads.push(identity);
            quads.extend_from_slice(entries);
            self.ctx.copy_quads(tex, tmp, &quads);
            self.ctx.copy_quads(tmp, tex, &[identity]);
            return Ok(());
        };

        let src = src
            .as_any()
            .downcast_ref::<GlSurface<C>>()
            .ok_or(BackendError::IncompatibleSurface)?;
        if src.layout.format != self.layout.format {
            return Err(BackendError::FormatMismatch {
                src: src.layout.format,
                dst: self.layout.format,
            });
        }
        Self::check_entries(&src.layout, &self.layout, entries)?;

        let src_tex = src.tex.ensure()?;
        let dst_tex = self.tex.ensure()?;
        self.ctx.copy_quads(src_tex, dst_tex, entries);
        Ok(())
    }

    fn solid_fill(&mut self, color: VigsColor, rects: &[VigsRect]) -> Result<(), BackendError> {
        self.current()?;
        for rect in rects {
            self.layout.span(*rect)?;
        }
        let tex = self.tex.ensure()?;
        self.ctx
            .fill_rects(tex, rects, gl_color(self.layout.format, color));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`GlContext`] that models textures as BGRA byte arrays.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    struct FakeTex {
        width: u32,
        data: Vec<u8>,
    }

    impl FakeTex {
        fn offset(&self, x: u32, y: u32) -> usize {
            (y as usize * self.width as usize + x as usize) * 4
        }
    }

    pub struct FakeGl {
        current: AtomicBool,
        readback_current: AtomicBool,
        pub make_current_ok: AtomicBool,
        npot: bool,
        next_tex: AtomicU32,
        textures: Mutex<HashMap<u32, FakeTex>>,
        pub finishes: AtomicUsize,
        pub deletes: AtomicUsize,
    }

    impl FakeGl {
        pub fn new(npot: bool) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicBool::new(false),
                readback_current: AtomicBool::new(false),
                make_current_ok: AtomicBool::new(true),
                npot,
                next_tex: AtomicU32::new(1),
                textures: Mutex::new(HashMap::new()),
                finishes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            })
        }

        pub fn live_textures(&self) -> usize {
            self.textures.lock().unwrap().len()
        }

        fn texels(&self, tex: GlTexture, rect: VigsRect) -> Vec<u8> {
            let textures = self.textures.lock().unwrap();
            let t = &textures[&tex.0];
            let VigsRect { pos, size } = rect;
            let mut out = Vec::new();
            for row in 0..size.h {
                let off = t.offset(pos.x, pos.y + row);
                out.extend_from_slice(&t.data[off..off + size.w as usize * 4]);
            }
            out
        }

        fn put(&self, tex: GlTexture, rect: VigsRect, src: &[u8]) {
            let mut textures = self.textures.lock().unwrap();
            let t = textures.get_mut(&tex.0).unwrap();
            let VigsRect { pos, size } = rect;
            let row_bytes = size.w as usize * 4;
            for row in 0..size.h {
                let off = t.offset(pos.x, pos.y + row);
                let s = row as usize * row_bytes;
                t.data[off..off + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
            }
        }
    }

    impl GlContext for FakeGl {
        fn has_current(&self) -> bool {
            self.current.load(Ordering::SeqCst)
        }

        fn make_current(&self, enable: bool) -> bool {
            if enable && !self.make_current_ok.load(Ordering::SeqCst) {
                return false;
            }
            self.current.store(enable, Ordering::SeqCst);
            true
        }

        fn read_pixels_make_current(&self, enable: bool) -> bool {
            self.readback_current.store(enable, Ordering::SeqCst);
            true
        }

        fn has_extension(&self, name: &str) -> bool {
            self.npot && name == GL_EXT_TEXTURE_NPOT
        }

        fn gen_texture(&self, width: u32, height: u32) -> Option<GlTexture> {
            let name = self.next_tex.fetch_add(1, Ordering::SeqCst);
            self.textures.lock().unwrap().insert(
                name,
                FakeTex {
                    width,
                    data: vec![0u8; width as usize * height as usize * 4],
                },
            );
            Some(GlTexture(name))
        }

        fn delete_texture(&self, tex: GlTexture) {
            assert!(self.has_current(), "delete_texture without a current context");
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.textures.lock().unwrap().remove(&tex.0);
        }

        fn tex_sub_image(&self, tex: GlTexture, rect: VigsRect, src: &[u8]) {
            self.put(tex, rect, src);
        }

        fn read_tex_image(&self, tex: GlTexture, rect: VigsRect, dst: &mut [u8]) {
            let texels = self.texels(tex, rect);
            dst[..texels.len()].copy_from_slice(&texels);
        }

        fn copy_quads(&self, src: GlTexture, dst: GlTexture, entries: &[VigsCopy]) {
            let reads: Vec<(VigsRect, Vec<u8>)> = entries
                .iter()
                .map(|e| {
                    let VigsCopy { from, to, size } = *e;
                    (
                        VigsRect { pos: to, size },
                        self.texels(src, VigsRect { pos: from, size }),
                    )
                })
                .collect();
            for (rect, texels) in reads {
                self.put(dst, rect, &texels);
            }
        }

        fn fill_rects(&self, tex: GlTexture, rects: &[VigsRect], color: GlColor) {
            for rect in rects {
                let size = rect.size;
                let px = [color.b, color.g, color.r, color.a];
                let texels: Vec<u8> = (0..size.w * size.h).flat_map(|_| px).collect();
                self.put(tex, *rect, &texels);
            }
        }

        fn finish(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
