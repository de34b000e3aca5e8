//! VIGS command batch layouts.
//!
//! A guest submission is one batch: a [`VigsCmdBatchHeader`] followed by `size` bytes of
//! requests. Every request is a [`VigsCmdRequestHeader`] followed by `size` bytes of payload.
//! All integers are little-endian `u32`/`i32` and structures are packed.

pub type VigsSurfaceId = u32;
pub type VigsFenceSeq = u32;
pub type VigsColor = u32;

pub const VIGS_PROTOCOL_VERSION: u32 = 20;

pub const VIGS_MAX_PLANES: usize = 2;

/// Number of surface slots carried by `set_plane` (enough for three-plane YUV plus one spare).
pub const VIGS_PLANE_SURFACES: usize = 4;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VigsCmd {
    Init = 0x0,
    Reset = 0x1,
    Exit = 0x2,
    SetRootSurface = 0x3,
    CreateSurface = 0x4,
    DestroySurface = 0x5,
    UpdateVram = 0x6,
    UpdateGpu = 0x7,
    Copy = 0x8,
    SolidFill = 0x9,
    SetPlane = 0xA,
    GaCopy = 0xB,
}

impl VigsCmd {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0 => Some(Self::Init),
            0x1 => Some(Self::Reset),
            0x2 => Some(Self::Exit),
            0x3 => Some(Self::SetRootSurface),
            0x4 => Some(Self::CreateSurface),
            0x5 => Some(Self::DestroySurface),
            0x6 => Some(Self::UpdateVram),
            0x7 => Some(Self::UpdateGpu),
            0x8 => Some(Self::Copy),
            0x9 => Some(Self::SolidFill),
            0xA => Some(Self::SetPlane),
            0xB => Some(Self::GaCopy),
            _ => None,
        }
    }

    /// Commands executed on the dispatch thread when they lead a batch.
    pub const fn is_sync(self) -> bool {
        matches!(
            self,
            Self::Init | Self::Reset | Self::Exit | Self::SetRootSurface
        )
    }

    /// Commands allowed inside an asynchronous batch.
    pub const fn is_batched(self) -> bool {
        !self.is_sync()
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VigsSurfaceFormat {
    Bgrx8888 = 0x0,
    Bgra8888 = 0x1,
}

impl VigsSurfaceFormat {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0 => Some(Self::Bgrx8888),
            0x1 => Some(Self::Bgra8888),
            _ => None,
        }
    }

    /// Bytes per pixel.
    pub const fn bpp(self) -> u32 {
        match self {
            Self::Bgrx8888 | Self::Bgra8888 => 4,
        }
    }

    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::Bgra8888)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VigsPlaneFormat {
    #[default]
    Bgrx8888 = 0x0,
    Bgra8888 = 0x1,
    Nv21 = 0x2,
    Nv42 = 0x3,
    Nv61 = 0x4,
    Yuv420 = 0x5,
}

impl VigsPlaneFormat {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0 => Some(Self::Bgrx8888),
            0x1 => Some(Self::Bgra8888),
            0x2 => Some(Self::Nv21),
            0x3 => Some(Self::Nv42),
            0x4 => Some(Self::Nv61),
            0x5 => Some(Self::Yuv420),
            _ => None,
        }
    }

    /// Number of leading `surfaces[]` slots the format consumes.
    pub const fn num_surfaces(self) -> usize {
        match self {
            Self::Bgrx8888 | Self::Bgra8888 => 1,
            Self::Nv21 | Self::Nv42 | Self::Nv61 => 2,
            Self::Yuv420 => 3,
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VigsRotation {
    #[default]
    Rotation0 = 0x0,
    Rotation90 = 0x1,
    Rotation180 = 0x2,
    Rotation270 = 0x3,
}

impl VigsRotation {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0 => Some(Self::Rotation0),
            0x1 => Some(Self::Rotation90),
            0x2 => Some(Self::Rotation180),
            0x3 => Some(Self::Rotation270),
            _ => None,
        }
    }

    pub const fn degrees(self) -> u32 {
        match self {
            Self::Rotation0 => 0,
            Self::Rotation90 => 90,
            Self::Rotation180 => 180,
            Self::Rotation270 => 270,
        }
    }
}

/* ------------------------------- Geometry -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsPoint {
    pub x: u32,
    pub y: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsSize {
    pub w: u32,
    pub h: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsRect {
    pub pos: VigsPoint,
    pub size: VigsSize,
}

impl VigsRect {
    pub const SIZE_BYTES: usize = 16;

    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            pos: VigsPoint { x, y },
            size: VigsSize { w, h },
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCopy {
    pub from: VigsPoint,
    pub to: VigsPoint,
    pub size: VigsSize,
}

impl VigsCopy {
    pub const SIZE_BYTES: usize = 24;

    pub const fn new(from: (u32, u32), to: (u32, u32), size: (u32, u32)) -> Self {
        Self {
            from: VigsPoint {
                x: from.0,
                y: from.1,
            },
            to: VigsPoint { x: to.0, y: to.1 },
            size: VigsSize {
                w: size.0,
                h: size.1,
            },
        }
    }
}

/* -------------------------------- Headers -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdBatchHeader {
    /// Fence sequence requested by this batch, 0 for none.
    pub fence_seq: VigsFenceSeq,
    /// Bytes of requests following this header. Can be 0.
    pub size: u32,
}

impl VigsCmdBatchHeader {
    pub const SIZE_BYTES: usize = 8;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdRequestHeader {
    pub cmd: u32,
    /// Bytes of payload following this header.
    pub size: u32,
}

impl VigsCmdRequestHeader {
    pub const SIZE_BYTES: usize = 8;
}

/* -------------------------------- Requests ------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdInitRequest {
    pub client_version: u32,
    /// Filled in by the host.
    pub server_version: u32,
}

impl VigsCmdInitRequest {
    pub const SIZE_BYTES: usize = 8;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdSetRootSurfaceRequest {
    pub id: VigsSurfaceId,
    pub scanout: u32,
    pub offset: u32,
}

impl VigsCmdSetRootSurfaceRequest {
    pub const SIZE_BYTES: usize = 12;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdCreateSurfaceRequest {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32, // VigsSurfaceFormat
    pub id: VigsSurfaceId,
}

impl VigsCmdCreateSurfaceRequest {
    pub const SIZE_BYTES: usize = 20;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdDestroySurfaceRequest {
    pub id: VigsSurfaceId,
}

impl VigsCmdDestroySurfaceRequest {
    pub const SIZE_BYTES: usize = 4;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdUpdateVramRequest {
    pub sfc_id: VigsSurfaceId,
    pub offset: u32,
}

impl VigsCmdUpdateVramRequest {
    pub const SIZE_BYTES: usize = 8;
}

/// Followed by `num_entries` [`VigsRect`]s.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdUpdateGpuRequest {
    pub sfc_id: VigsSurfaceId,
    pub offset: u32,
    pub num_entries: u32,
}

impl VigsCmdUpdateGpuRequest {
    pub const SIZE_BYTES: usize = 12;
}

/// Followed by `num_entries` [`VigsCopy`]s.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdCopyRequest {
    pub src_id: VigsSurfaceId,
    pub dst_id: VigsSurfaceId,
    pub num_entries: u32,
}

impl VigsCmdCopyRequest {
    pub const SIZE_BYTES: usize = 12;
}

/// Followed by `num_entries` [`VigsRect`]s.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdSolidFillRequest {
    pub sfc_id: VigsSurfaceId,
    pub color: VigsColor,
    pub num_entries: u32,
}

impl VigsCmdSolidFillRequest {
    pub const SIZE_BYTES: usize = 12;
}

/// Pass 0 as `surfaces[0]` to disable the plane.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdSetPlaneRequest {
    pub plane: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32, // VigsPlaneFormat
    pub surfaces: [VigsSurfaceId; VIGS_PLANE_SURFACES],
    pub src_rect: VigsRect,
    pub dst_x: i32,
    pub dst_y: i32,
    pub dst_size: VigsSize,
    pub z_pos: i32,
    pub hflip: u32,
    pub vflip: u32,
    pub rotation: u32, // VigsRotation
}

impl VigsCmdSetPlaneRequest {
    pub const SIZE_BYTES: usize = 80;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VigsCmdGaCopyRequest {
    pub src_id: VigsSurfaceId,
    pub src_scanout: u32,
    pub src_offset: u32,
    pub src_stride: u32,
    pub dst_id: VigsSurfaceId,
    pub dst_stride: u32,
    pub entry: VigsCopy,
}

impl VigsCmdGaCopyRequest {
    pub const SIZE_BYTES: usize = 48;
}

/* -------------------------------- Decoding ------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VigsDecodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error(
        "request at offset {offset} ({request_size_bytes} bytes) overruns batch of {batch_size_bytes} bytes"
    )]
    RequestOverrunsBatch {
        offset: u32,
        request_size_bytes: u32,
        batch_size_bytes: u32,
    },
    #[error("payload size mismatch: expected {expected} bytes, found {found}")]
    PayloadSizeMismatch { expected: usize, found: usize },
    #[error("entry count overflows")]
    CountOverflow,
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    read_u32_le(buf, offset) as i32
}

fn check_payload_len(payload: &[u8], expected: usize) -> Result<(), VigsDecodeError> {
    if payload.len() < expected {
        return Err(VigsDecodeError::PayloadSizeMismatch {
            expected,
            found: payload.len(),
        });
    }
    Ok(())
}

fn read_rect_le(buf: &[u8], offset: usize) -> VigsRect {
    VigsRect::new(
        read_u32_le(buf, offset),
        read_u32_le(buf, offset + 4),
        read_u32_le(buf, offset + 8),
        read_u32_le(buf, offset + 12),
    )
}

fn read_copy_le(buf: &[u8], offset: usize) -> VigsCopy {
    VigsCopy::new(
        (read_u32_le(buf, offset), read_u32_le(buf, offset + 4)),
        (read_u32_le(buf, offset + 8), read_u32_le(buf, offset + 12)),
        (read_u32_le(buf, offset + 16), read_u32_le(buf, offset + 20)),
    )
}

/// Validates that `num_entries` entries of `entry_size` bytes fit after a `fixed`-byte prefix.
fn entries_range(
    payload: &[u8],
    fixed: usize,
    num_entries: u32,
    entry_size: usize,
) -> Result<usize, VigsDecodeError> {
    let entries_bytes = usize::try_from(num_entries)
        .ok()
        .and_then(|n| n.checked_mul(entry_size))
        .ok_or(VigsDecodeError::CountOverflow)?;
    let end = fixed
        .checked_add(entries_bytes)
        .ok_or(VigsDecodeError::CountOverflow)?;
    check_payload_len(payload, end)?;
    Ok(end)
}

pub fn decode_batch_header_le(buf: &[u8]) -> Result<VigsCmdBatchHeader, VigsDecodeError> {
    if buf.len() < VigsCmdBatchHeader::SIZE_BYTES {
        return Err(VigsDecodeError::BufferTooSmall);
    }
    Ok(VigsCmdBatchHeader {
        fence_seq: read_u32_le(buf, 0),
        size: read_u32_le(buf, 4),
    })
}

pub fn decode_request_header_le(buf: &[u8]) -> Result<VigsCmdRequestHeader, VigsDecodeError> {
    if buf.len() < VigsCmdRequestHeader::SIZE_BYTES {
        return Err(VigsDecodeError::BufferTooSmall);
    }
    Ok(VigsCmdRequestHeader {
        cmd: read_u32_le(buf, 0),
        size: read_u32_le(buf, 4),
    })
}

pub fn decode_cmd_init_le(payload: &[u8]) -> Result<VigsCmdInitRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdInitRequest::SIZE_BYTES)?;
    Ok(VigsCmdInitRequest {
        client_version: read_u32_le(payload, 0),
        server_version: read_u32_le(payload, 4),
    })
}

pub fn decode_cmd_set_root_surface_le(
    payload: &[u8],
) -> Result<VigsCmdSetRootSurfaceRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdSetRootSurfaceRequest::SIZE_BYTES)?;
    Ok(VigsCmdSetRootSurfaceRequest {
        id: read_u32_le(payload, 0),
        scanout: read_u32_le(payload, 4),
        offset: read_u32_le(payload, 8),
    })
}

pub fn decode_cmd_create_surface_le(
    payload: &[u8],
) -> Result<VigsCmdCreateSurfaceRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdCreateSurfaceRequest::SIZE_BYTES)?;
    Ok(VigsCmdCreateSurfaceRequest {
        width: read_u32_le(payload, 0),
        height: read_u32_le(payload, 4),
        stride: read_u32_le(payload, 8),
        format: read_u32_le(payload, 12),
        id: read_u32_le(payload, 16),
    })
}

pub fn decode_cmd_destroy_surface_le(
    payload: &[u8],
) -> Result<VigsCmdDestroySurfaceRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdDestroySurfaceRequest::SIZE_BYTES)?;
    Ok(VigsCmdDestroySurfaceRequest {
        id: read_u32_le(payload, 0),
    })
}

pub fn decode_cmd_update_vram_le(
    payload: &[u8],
) -> Result<VigsCmdUpdateVramRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdUpdateVramRequest::SIZE_BYTES)?;
    Ok(VigsCmdUpdateVramRequest {
        sfc_id: read_u32_le(payload, 0),
        offset: read_u32_le(payload, 4),
    })
}

/// Decode UPDATE_GPU and its trailing damage rectangles.
pub fn decode_cmd_update_gpu_le(
    payload: &[u8],
) -> Result<(VigsCmdUpdateGpuRequest, Vec<VigsRect>), VigsDecodeError> {
    check_payload_len(payload, VigsCmdUpdateGpuRequest::SIZE_BYTES)?;
    let cmd = VigsCmdUpdateGpuRequest {
        sfc_id: read_u32_le(payload, 0),
        offset: read_u32_le(payload, 4),
        num_entries: read_u32_le(payload, 8),
    };
    let rects = decode_rects(payload, VigsCmdUpdateGpuRequest::SIZE_BYTES, cmd.num_entries)?;
    Ok((cmd, rects))
}

/// Decode COPY and its trailing `{from, to, size}` entries.
pub fn decode_cmd_copy_le(
    payload: &[u8],
) -> Result<(VigsCmdCopyRequest, Vec<VigsCopy>), VigsDecodeError> {
    check_payload_len(payload, VigsCmdCopyRequest::SIZE_BYTES)?;
    let cmd = VigsCmdCopyRequest {
        src_id: read_u32_le(payload, 0),
        dst_id: read_u32_le(payload, 4),
        num_entries: read_u32_le(payload, 8),
    };
    let start = VigsCmdCopyRequest::SIZE_BYTES;
    let end = entries_range(payload, start, cmd.num_entries, VigsCopy::SIZE_BYTES)?;
    let entries = (start..end)
        .step_by(VigsCopy::SIZE_BYTES)
        .map(|off| read_copy_le(payload, off))
        .collect();
    Ok((cmd, entries))
}

/// Decode SOLID_FILL and its trailing rectangles.
pub fn decode_cmd_solid_fill_le(
    payload: &[u8],
) -> Result<(VigsCmdSolidFillRequest, Vec<VigsRect>), VigsDecodeError> {
    check_payload_len(payload, VigsCmdSolidFillRequest::SIZE_BYTES)?;
    let cmd = VigsCmdSolidFillRequest {
        sfc_id: read_u32_le(payload, 0),
        color: read_u32_le(payload, 4),
        num_entries: read_u32_le(payload, 8),
    };
    let rects = decode_rects(payload, VigsCmdSolidFillRequest::SIZE_BYTES, cmd.num_entries)?;
    Ok((cmd, rects))
}

fn decode_rects(
    payload: &[u8],
    start: usize,
    num_entries: u32,
) -> Result<Vec<VigsRect>, VigsDecodeError> {
    let end = entries_range(payload, start, num_entries, VigsRect::SIZE_BYTES)?;
    Ok((start..end)
        .step_by(VigsRect::SIZE_BYTES)
        .map(|off| read_rect_le(payload, off))
        .collect())
}

pub fn decode_cmd_set_plane_le(payload: &[u8]) -> Result<VigsCmdSetPlaneRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdSetPlaneRequest::SIZE_BYTES)?;
    Ok(VigsCmdSetPlaneRequest {
        plane: read_u32_le(payload, 0),
        width: read_u32_le(payload, 4),
        height: read_u32_le(payload, 8),
        format: read_u32_le(payload, 12),
        surfaces: [
            read_u32_le(payload, 16),
            read_u32_le(payload, 20),
            read_u32_le(payload, 24),
            read_u32_le(payload, 28),
        ],
        src_rect: read_rect_le(payload, 32),
        dst_x: read_i32_le(payload, 48),
        dst_y: read_i32_le(payload, 52),
        dst_size: VigsSize {
            w: read_u32_le(payload, 56),
            h: read_u32_le(payload, 60),
        },
        z_pos: read_i32_le(payload, 64),
        hflip: read_u32_le(payload, 68),
        vflip: read_u32_le(payload, 72),
        rotation: read_u32_le(payload, 76),
    })
}

pub fn decode_cmd_ga_copy_le(payload: &[u8]) -> Result<VigsCmdGaCopyRequest, VigsDecodeError> {
    check_payload_len(payload, VigsCmdGaCopyRequest::SIZE_BYTES)?;
    Ok(VigsCmdGaCopyRequest {
        src_id: read_u32_le(payload, 0),
        src_scanout: read_u32_le(payload, 4),
        src_offset: read_u32_le(payload, 8),
        src_stride: read_u32_le(payload, 12),
        dst_id: read_u32_le(payload, 16),
        dst_stride: read_u32_le(payload, 20),
        entry: read_copy_le(payload, 24),
    })
}

/* ------------------------------- Iteration ------------------------------- */

#[derive(Clone, Copy, Debug)]
pub struct VigsRequestPacket<'a> {
    pub hdr: VigsCmdRequestHeader,
    pub cmd: Option<VigsCmd>,
    pub payload: &'a [u8],
}

/// Walks the requests of one batch (batch header included in `buf`).
///
/// Stops for good after the first framing error: once a request header can't be trusted there
/// is no way to find the next one.
pub struct VigsBatchIter<'a> {
    header: VigsCmdBatchHeader,
    buf: &'a [u8],
    offset: usize,
    end: usize,
    done: bool,
}

impl<'a> VigsBatchIter<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, VigsDecodeError> {
        let header = decode_batch_header_le(buf)?;
        let end = usize::try_from(header.size)
            .ok()
            .and_then(|size| size.checked_add(VigsCmdBatchHeader::SIZE_BYTES))
            .ok_or(VigsDecodeError::CountOverflow)?;
        if buf.len() < end {
            return Err(VigsDecodeError::BufferTooSmall);
        }

        Ok(Self {
            header,
            buf,
            offset: VigsCmdBatchHeader::SIZE_BYTES,
            end,
            done: false,
        })
    }

    pub fn header(&self) -> &VigsCmdBatchHeader {
        &self.header
    }

    fn fail(&mut self, err: VigsDecodeError) -> Option<Result<VigsRequestPacket<'a>, VigsDecodeError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for VigsBatchIter<'a> {
    type Item = Result<VigsRequestPacket<'a>, VigsDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.end {
            return None;
        }

        let hdr_end = match self.offset.checked_add(VigsCmdRequestHeader::SIZE_BYTES) {
            Some(end) => end,
            None => return self.fail(VigsDecodeError::CountOverflow),
        };
        if hdr_end > self.end {
            return self.fail(VigsDecodeError::BufferTooSmall);
        }

        let hdr = match decode_request_header_le(&self.buf[self.offset..self.end]) {
            Ok(hdr) => hdr,
            Err(err) => return self.fail(err),
        };

        let packet_end = match usize::try_from(hdr.size)
            .ok()
            .and_then(|size| hdr_end.checked_add(size))
        {
            Some(end) => end,
            None => return self.fail(VigsDecodeError::CountOverflow),
        };
        if packet_end > self.end {
            let offset = (self.offset - VigsCmdBatchHeader::SIZE_BYTES) as u32;
            let batch_size_bytes = self.header.size;
            return self.fail(VigsDecodeError::RequestOverrunsBatch {
                offset,
                request_size_bytes: hdr.size,
                batch_size_bytes,
            });
        }

        let packet = VigsRequestPacket {
            hdr,
            cmd: VigsCmd::from_u32(hdr.cmd),
            payload: &self.buf[hdr_end..packet_end],
        };

        self.offset = packet_end;
        Some(Ok(packet))
    }
}
