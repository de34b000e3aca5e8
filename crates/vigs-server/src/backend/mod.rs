//! Rendering backend contract.
//!
//! A [`Backend`] creates surfaces and brackets each batch of GPU work with
//! [`Backend::batch_start`]/[`Backend::batch_end`]. Every surface it creates carries a
//! [`SurfaceOps`] implementation that performs the pixel operations. Two implementations live
//! here: [`sw::SwBackend`], a plain CPU rasterizer, and [`gl::GlBackend`], which drives a
//! platform GL context through [`gl::GlContext`].

pub mod gl;
pub mod pool;
pub mod sw;

use std::any::Any;

use vigs_protocol::vigs::vigs_cmd::{
    VigsColor, VigsCopy, VigsRect, VigsSurfaceFormat, VigsSurfaceId,
};

use crate::surface::Surface;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("invalid surface geometry {width}x{height}, stride {stride}")]
    InvalidGeometry { width: u32, height: u32, stride: u32 },
    #[error("custom stride {stride} not supported for width {width}")]
    UnsupportedStride { width: u32, stride: u32 },
    #[error("rect ({x}, {y}) {w}x{h} is outside the {width}x{height} surface")]
    OutOfBounds {
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        width: u32,
        height: u32,
    },
    #[error("pixel buffer too small: need {needed} bytes, have {found}")]
    BufferTooSmall { needed: usize, found: usize },
    #[error("surface format mismatch: {src:?} -> {dst:?}")]
    FormatMismatch {
        src: VigsSurfaceFormat,
        dst: VigsSurfaceFormat,
    },
    #[error("source surface belongs to a different backend")]
    IncompatibleSurface,
    #[error("rendering context is not current")]
    NotCurrent,
    #[error("make_current failed")]
    MakeCurrentFailed,
    #[error("allocation failed: {0}")]
    AllocationFailed(&'static str),
    #[error("required GL extension missing: {0}")]
    MissingExtension(&'static str),
}

/// Pixel operations of one backend surface.
///
/// Pixel buffers passed in and out are laid out like the surface itself: row `y` starts at
/// `y * stride`, pixel `x` at `x * bpp` within the row.
pub trait SurfaceOps: Send {
    fn read_pixels(&mut self, rect: VigsRect, dst: &mut [u8]) -> Result<(), BackendError>;

    fn draw_pixels(&mut self, src: &[u8], rects: &[VigsRect]) -> Result<(), BackendError>;

    /// `src == None` means source and destination are the same surface.
    fn copy(
        &mut self,
        src: Option<&dyn SurfaceOps>,
        entries: &[VigsCopy],
    ) -> Result<(), BackendError>;

    fn solid_fill(&mut self, color: VigsColor, rects: &[VigsRect]) -> Result<(), BackendError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    ) -> Result<Surface, BackendError>;

    fn batch_start(&mut self) -> Result<(), BackendError>;

    fn batch_end(&mut self);
}

/// Surface geometry plus the bounds arithmetic shared by the backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceLayout {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: VigsSurfaceFormat,
}

/// Byte span of a rectangle within a surface-shaped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RectSpan {
    /// Offset of the rect's first byte.
    pub start: usize,
    /// Bytes per rect row.
    pub row_bytes: usize,
    pub rows: usize,
    pub stride: usize,
}

impl RectSpan {
    /// One past the last byte touched.
    pub fn end(&self) -> usize {
        if self.rows == 0 {
            return self.start;
        }
        self.start + (self.rows - 1) * self.stride + self.row_bytes
    }

    pub fn row_offset(&self, row: usize) -> usize {
        self.start + row * self.stride
    }
}

impl SurfaceLayout {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
    ) -> Result<Self, BackendError> {
        let invalid = BackendError::InvalidGeometry {
            width,
            height,
            stride,
        };
        let row_bytes = width.checked_mul(format.bpp()).ok_or(invalid.clone())?;
        if stride < row_bytes {
            return Err(invalid);
        }
        stride
            .checked_mul(height)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or(invalid)?;
        Ok(Self {
            width,
            height,
            stride,
            format,
        })
    }

    pub fn bpp(&self) -> usize {
        self.format.bpp() as usize
    }

    pub fn data_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    pub fn full_rect(&self) -> VigsRect {
        VigsRect::new(0, 0, self.width, self.height)
    }

    /// Checks `rect` against the surface and returns its byte span.
    pub fn span(&self, rect: VigsRect) -> Result<RectSpan, BackendError> {
        let VigsRect { pos, size } = rect;
        let (x, y, w, h) = (pos.x, pos.y, size.w, size.h);
        let fits = |origin: u32, extent: u32, limit: u32| {
            origin
                .checked_add(extent)
                .is_some_and(|end| end <= limit)
        };
        if !fits(x, w, self.width) || !fits(y, h, self.height) {
            return Err(BackendError::OutOfBounds {
                x,
                y,
                w,
                h,
                width: self.width,
                height: self.height,
            });
        }

        let bpp = self.bpp();
        let stride = self.stride as usize;
        Ok(RectSpan {
            start: y as usize * stride + x as usize * bpp,
            row_bytes: w as usize * bpp,
            rows: h as usize,
            stride,
        })
    }

    /// Ensures an external buffer covers `span`.
    pub fn check_buffer(span: &RectSpan, len: usize) -> Result<(), BackendError> {
        if span.end() > len {
            return Err(BackendError::BufferTooSmall {
                needed: span.end(),
                found: len,
            });
        }
        Ok(())
    }
}

/// Zero-filled buffer for `len` bytes of pixels. A failed allocation is an error, not an abort.
pub fn zeroed_buffer(len: usize) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| BackendError::AllocationFailed("pixel buffer"))?;
    buf.resize(len, 0);
    Ok(buf)
}
