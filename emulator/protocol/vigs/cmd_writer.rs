//! Safe batch builder for the VIGS command protocol.
//!
//! Intended for tests and host-side tooling that needs to emit well-formed batches (correct
//! request `size` fields and batch header bookkeeping).

use core::mem::offset_of;

use super::vigs_cmd::{
    VigsCmd, VigsCmdBatchHeader, VigsCmdCreateSurfaceRequest, VigsCmdGaCopyRequest,
    VigsCmdInitRequest, VigsCmdRequestHeader, VigsCmdSetPlaneRequest,
    VigsCmdSetRootSurfaceRequest, VigsColor, VigsCopy, VigsFenceSeq, VigsRect, VigsSurfaceFormat,
    VigsSurfaceId, VIGS_PROTOCOL_VERSION,
};

/// Builds one batch: header plus any number of requests.
#[derive(Debug, Clone)]
pub struct VigsCmdWriter {
    buf: Vec<u8>,
}

impl Default for VigsCmdWriter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl VigsCmdWriter {
    pub fn new(fence_seq: VigsFenceSeq) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.reset(fence_seq);
        w
    }

    pub fn reset(&mut self, fence_seq: VigsFenceSeq) {
        self.buf.clear();
        self.buf.resize(VigsCmdBatchHeader::SIZE_BYTES, 0);
        self.write_u32_at(offset_of!(VigsCmdBatchHeader, fence_seq), fence_seq);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() - VigsCmdBatchHeader::SIZE_BYTES;
        assert!(size <= u32::MAX as usize, "batch too large for u32 size");
        self.write_u32_at(offset_of!(VigsCmdBatchHeader, size), size as u32);
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= VigsCmdBatchHeader::SIZE_BYTES
    }

    fn write_u32_at(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn write_i32_at(&mut self, offset: usize, v: i32) {
        self.write_u32_at(offset, v as u32);
    }

    fn write_rect_at(&mut self, offset: usize, rect: &VigsRect) {
        let VigsRect { pos, size } = *rect;
        self.write_u32_at(offset, pos.x);
        self.write_u32_at(offset + 4, pos.y);
        self.write_u32_at(offset + 8, size.w);
        self.write_u32_at(offset + 12, size.h);
    }

    fn write_copy_at(&mut self, offset: usize, entry: &VigsCopy) {
        let VigsCopy { from, to, size } = *entry;
        self.write_u32_at(offset, from.x);
        self.write_u32_at(offset + 4, from.y);
        self.write_u32_at(offset + 8, to.x);
        self.write_u32_at(offset + 12, to.y);
        self.write_u32_at(offset + 16, size.w);
        self.write_u32_at(offset + 20, size.h);
    }

    /// Appends a request header and `payload_size` zeroed bytes, returning the payload offset.
    fn append_raw(&mut self, cmd: u32, payload_size: usize) -> usize {
        assert!(
            payload_size <= u32::MAX as usize,
            "request payload too large for u32 size"
        );

        let offset = self.buf.len();
        self.buf
            .resize(offset + VigsCmdRequestHeader::SIZE_BYTES + payload_size, 0);

        self.write_u32_at(offset + offset_of!(VigsCmdRequestHeader, cmd), cmd);
        self.write_u32_at(
            offset + offset_of!(VigsCmdRequestHeader, size),
            payload_size as u32,
        );
        offset + VigsCmdRequestHeader::SIZE_BYTES
    }

    /// Emits an arbitrary request, including ids the host doesn't know.
    pub fn raw(&mut self, cmd: u32, payload: &[u8]) {
        let base = self.append_raw(cmd, payload.len());
        self.buf[base..base + payload.len()].copy_from_slice(payload);
    }

    pub fn init(&mut self) {
        self.init_with_version(VIGS_PROTOCOL_VERSION);
    }

    pub fn init_with_version(&mut self, client_version: u32) {
        let base = self.append_raw(VigsCmd::Init as u32, VigsCmdInitRequest::SIZE_BYTES);
        self.write_u32_at(
            base + offset_of!(VigsCmdInitRequest, client_version),
            client_version,
        );
    }

    pub fn reset_cmd(&mut self) {
        self.append_raw(VigsCmd::Reset as u32, 0);
    }

    pub fn exit(&mut self) {
        self.append_raw(VigsCmd::Exit as u32, 0);
    }

    pub fn set_root_surface(&mut self, id: VigsSurfaceId, scanout: bool, offset: u32) {
        let base = self.append_raw(
            VigsCmd::SetRootSurface as u32,
            VigsCmdSetRootSurfaceRequest::SIZE_BYTES,
        );
        self.write_u32_at(base + offset_of!(VigsCmdSetRootSurfaceRequest, id), id);
        self.write_u32_at(
            base + offset_of!(VigsCmdSetRootSurfaceRequest, scanout),
            scanout as u32,
        );
        self.write_u32_at(base + offset_of!(VigsCmdSetRootSurfaceRequest, offset), offset);
    }

    pub fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    ) {
        self.create_surface_raw_format(width, height, stride, format as u32, id);
    }

    pub fn create_surface_raw_format(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: u32,
        id: VigsSurfaceId,
    ) {
        let base = self.append_raw(
            VigsCmd::CreateSurface as u32,
            VigsCmdCreateSurfaceRequest::SIZE_BYTES,
        );
        self.write_u32_at(base + offset_of!(VigsCmdCreateSurfaceRequest, width), width);
        self.write_u32_at(base + offset_of!(VigsCmdCreateSurfaceRequest, height), height);
        self.write_u32_at(base + offset_of!(VigsCmdCreateSurfaceRequest, stride), stride);
        self.write_u32_at(base + offset_of!(VigsCmdCreateSurfaceRequest, format), format);
        self.write_u32_at(base + offset_of!(VigsCmdCreateSurfaceRequest, id), id);
    }

    pub fn destroy_surface(&mut self, id: VigsSurfaceId) {
        let base = self.append_raw(VigsCmd::DestroySurface as u32, 4);
        self.write_u32_at(base, id);
    }

    pub fn update_vram(&mut self, sfc_id: VigsSurfaceId, offset: u32) {
        let base = self.append_raw(VigsCmd::UpdateVram as u32, 8);
        self.write_u32_at(base, sfc_id);
        self.write_u32_at(base + 4, offset);
    }

    pub fn update_gpu(&mut self, sfc_id: VigsSurfaceId, offset: u32, rects: &[VigsRect]) {
        let base = self.append_raw(
            VigsCmd::UpdateGpu as u32,
            12 + rects.len() * VigsRect::SIZE_BYTES,
        );
        self.write_u32_at(base, sfc_id);
        self.write_u32_at(base + 4, offset);
        self.write_u32_at(base + 8, rects.len() as u32);
        for (i, rect) in rects.iter().enumerate() {
            self.write_rect_at(base + 12 + i * VigsRect::SIZE_BYTES, rect);
        }
    }

    pub fn copy(&mut self, src_id: VigsSurfaceId, dst_id: VigsSurfaceId, entries: &[VigsCopy]) {
        let base = self.append_raw(
            VigsCmd::Copy as u32,
            12 + entries.len() * VigsCopy::SIZE_BYTES,
        );
        self.write_u32_at(base, src_id);
        self.write_u32_at(base + 4, dst_id);
        self.write_u32_at(base + 8, entries.len() as u32);
        for (i, entry) in entries.iter().enumerate() {
            self.write_copy_at(base + 12 + i * VigsCopy::SIZE_BYTES, entry);
        }
    }

    pub fn solid_fill(&mut self, sfc_id: VigsSurfaceId, color: VigsColor, rects: &[VigsRect]) {
        let base = self.append_raw(
            VigsCmd::SolidFill as u32,
            12 + rects.len() * VigsRect::SIZE_BYTES,
        );
        self.write_u32_at(base, sfc_id);
        self.write_u32_at(base + 4, color);
        self.write_u32_at(base + 8, rects.len() as u32);
        for (i, rect) in rects.iter().enumerate() {
            self.write_rect_at(base + 12 + i * VigsRect::SIZE_BYTES, rect);
        }
    }

    pub fn set_plane(&mut self, req: &VigsCmdSetPlaneRequest) {
        let req = *req;
        let base = self.append_raw(VigsCmd::SetPlane as u32, VigsCmdSetPlaneRequest::SIZE_BYTES);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, plane), req.plane);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, width), req.width);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, height), req.height);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, format), req.format);
        let surfaces = req.surfaces;
        for (i, id) in surfaces.iter().enumerate() {
            self.write_u32_at(
                base + offset_of!(VigsCmdSetPlaneRequest, surfaces) + i * 4,
                *id,
            );
        }
        let src_rect = req.src_rect;
        self.write_rect_at(base + offset_of!(VigsCmdSetPlaneRequest, src_rect), &src_rect);
        self.write_i32_at(base + offset_of!(VigsCmdSetPlaneRequest, dst_x), req.dst_x);
        self.write_i32_at(base + offset_of!(VigsCmdSetPlaneRequest, dst_y), req.dst_y);
        let dst_size = req.dst_size;
        let dst_size_off = base + offset_of!(VigsCmdSetPlaneRequest, dst_size);
        self.write_u32_at(dst_size_off, dst_size.w);
        self.write_u32_at(dst_size_off + 4, dst_size.h);
        self.write_i32_at(base + offset_of!(VigsCmdSetPlaneRequest, z_pos), req.z_pos);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, hflip), req.hflip);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, vflip), req.vflip);
        self.write_u32_at(base + offset_of!(VigsCmdSetPlaneRequest, rotation), req.rotation);
    }

    pub fn ga_copy(&mut self, req: &VigsCmdGaCopyRequest) {
        let req = *req;
        let base = self.append_raw(VigsCmd::GaCopy as u32, VigsCmdGaCopyRequest::SIZE_BYTES);
        self.write_u32_at(base + offset_of!(VigsCmdGaCopyRequest, src_id), req.src_id);
        self.write_u32_at(
            base + offset_of!(VigsCmdGaCopyRequest, src_scanout),
            req.src_scanout,
        );
        self.write_u32_at(
            base + offset_of!(VigsCmdGaCopyRequest, src_offset),
            req.src_offset,
        );
        self.write_u32_at(
            base + offset_of!(VigsCmdGaCopyRequest, src_stride),
            req.src_stride,
        );
        self.write_u32_at(base + offset_of!(VigsCmdGaCopyRequest, dst_id), req.dst_id);
        self.write_u32_at(
            base + offset_of!(VigsCmdGaCopyRequest, dst_stride),
            req.dst_stride,
        );
        let entry = req.entry;
        self.write_copy_at(base + offset_of!(VigsCmdGaCopyRequest, entry), &entry);
    }
}
