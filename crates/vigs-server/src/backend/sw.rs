//! CPU rasterizer backend.
//!
//! Each surface is a plain `stride * height` byte buffer in the surface's own layout, so reads,
//! uploads, copies and fills are row-wise `memcpy`s. Useful headless and as the reference the GL
//! backend is tested against.

use std::any::Any;

use vigs_protocol::vigs::vigs_cmd::{
    VigsColor, VigsCopy, VigsRect, VigsSurfaceFormat, VigsSurfaceId,
};

use super::{zeroed_buffer, Backend, BackendError, RectSpan, SurfaceLayout, SurfaceOps};
use crate::surface::{Surface, SurfaceHandle, WinsysSurface};

#[derive(Debug, Default)]
pub struct SwBackend {
    _private: (),
}

impl SwBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for SwBackend {
    fn name(&self) -> &'static str {
        "sw"
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
        let handle = SurfaceHandle::new(id);
        let ws = WinsysSurface::new(width, height, &handle, ());
        let ops = SwSurface::new(layout)?;
        Ok(Surface::new(handle, ws, stride, format, Box::new(ops)))
    }

    fn batch_start(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn batch_end(&mut self) {}
}

#[derive(Debug)]
pub struct SwSurface {
    layout: SurfaceLayout,
    data: Vec<u8>,
}

impl SwSurface {
    pub fn new(layout: SurfaceLayout) -> Result<Self, BackendError> {
        Ok(Self {
            data: zeroed_buffer(layout.data_size())?,
            layout,
        })
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Pixel bytes of `color` as stored in memory (B, G, R, A).
///
/// `bgrx` surfaces are opaque: the alpha byte is forced to 0xFF.
pub fn fill_pixel(format: VigsSurfaceFormat, color: VigsColor) -> [u8; 4] {
    let color = if format.has_alpha() {
        color
    } else {
        color | 0xFF00_0000
    };
    color.to_le_bytes()
}

fn copy_rows(dst: &mut [u8], dst_span: &RectSpan, src: &[u8], src_span: &RectSpan) {
    for row in 0..dst_span.rows {
        let d = dst_span.row_offset(row);
        let s = src_span.row_offset(row);
        dst[d..d + dst_span.row_bytes].copy_from_slice(&src[s..s + src_span.row_bytes]);
    }
}

impl SurfaceOps for SwSurface {
    fn read_pixels(&mut self, rect: VigsRect, dst: &mut [u8]) -> Result<(), BackendError> {
        let span = self.layout.span(rect)?;
        SurfaceLayout::check_buffer(&span, dst.len())?;
        copy_rows(dst, &span, &self.data, &span);
        Ok(())
    }

    fn draw_pixels(&mut self, src: &[u8], rects: &[VigsRect]) -> Result<(), BackendError> {
        for rect in rects {
            let span = self.layout.span(*rect)?;
            SurfaceLayout::check_buffer(&span, src.len())?;
            copy_rows(&mut self.data, &span, src, &span);
        }
        Ok(())
    }

    fn copy(
        &mut self,
        src: Option<&dyn SurfaceOps>,
        entries: &[VigsCopy],
    ) -> Result<(), BackendError> {
        let Some(src) = src else {
            return self.copy_within(entries);
        };
        let src = src
            .as_any()
            .downcast_ref::<SwSurface>()
            .ok_or(BackendError::IncompatibleSurface)?;
        if src.layout.format != self.layout.format {
            return Err(BackendError::FormatMismatch {
                src: src.layout.format,
                dst: self.layout.format,
            });
        }

        for entry in entries {
            let (src_span, dst_span) = copy_spans(&src.layout, &self.layout, entry)?;
            copy_rows(&mut self.data, &dst_span, &src.data, &src_span);
        }
        Ok(())
    }

    fn solid_fill(&mut self, color: VigsColor, rects: &[VigsRect]) -> Result<(), BackendError> {
        let pixel = fill_pixel(self.layout.format, color);

        for rect in rects {
            let span = self.layout.span(*rect)?;
            if span.rows == 0 || span.row_bytes == 0 {
                continue;
            }

            let first = span.start;
            for chunk in self.data[first..first + span.row_bytes].chunks_exact_mut(pixel.len()) {
                chunk.copy_from_slice(&pixel);
            }
            for row in 1..span.rows {
                let off = span.row_offset(row);
                self.data.copy_within(first..first + span.row_bytes, off);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SwSurface {
    fn copy_within(&mut self, entries: &[VigsCopy]) -> Result<(), BackendError> {
        for entry in entries {
            let (src_span, dst_span) = copy_spans(&self.layout, &self.layout, entry)?;
            let (from_y, to_y) = (entry.from.y, entry.to.y);

            // Moving content down: walk rows bottom-up so no source row is overwritten first.
            let rows: Box<dyn Iterator<Item = usize>> = if from_y < to_y {
                Box::new((0..dst_span.rows).rev())
            } else {
                Box::new(0..dst_span.rows)
            };
            for row in rows {
                let s = src_span.row_offset(row);
                self.data
                    .copy_within(s..s + src_span.row_bytes, dst_span.row_offset(row));
            }
        }
        Ok(())
    }
}

fn copy_spans(
    src: &SurfaceLayout,
    dst: &SurfaceLayout,
    entry: &VigsCopy,
) -> Result<(RectSpan, RectSpan), BackendError> {
    let VigsCopy { from, to, size } = *entry;
    let src_span = src.span(VigsRect { pos: from, size })?;
    let dst_span = dst.span(VigsRect { pos: to, size })?;
    Ok((src_span, dst_span))
}
