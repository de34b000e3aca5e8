//! Guest command dispatch.
//!
//! [`Comm::dispatch`] runs on the device thread when the guest signals a batch offset in RAM.
//! A batch whose first request is init/reset/exit/set_root_surface is handled right away and the
//! rest of it is ignored. Any other batch is copied out of guest memory as a whole and handed to
//! [`CommOps::batch`]; [`dispatch_batch`] later walks that copy on the render thread.

use std::sync::Arc;

use tracing::{error, trace};
use vigs_protocol::vigs::vigs_cmd::{
    decode_batch_header_le, decode_cmd_copy_le, decode_cmd_create_surface_le,
    decode_cmd_destroy_surface_le, decode_cmd_ga_copy_le, decode_cmd_init_le,
    decode_cmd_set_plane_le, decode_cmd_set_root_surface_le, decode_cmd_solid_fill_le,
    decode_cmd_update_gpu_le, decode_cmd_update_vram_le, decode_request_header_le, VigsBatchIter,
    VigsCmd, VigsCmdBatchHeader, VigsCmdCreateSurfaceRequest, VigsCmdGaCopyRequest,
    VigsCmdInitRequest, VigsCmdRequestHeader, VigsCmdSetPlaneRequest,
    VigsCmdSetRootSurfaceRequest, VigsColor, VigsCopy, VigsDecodeError, VigsFenceSeq, VigsRect,
    VigsSurfaceFormat, VigsSurfaceId, VIGS_PROTOCOL_VERSION,
};

use crate::error::ServerError;
use crate::memory::{GuestMemory, GuestMemoryError};

/// Synchronous control commands.
pub trait CommOps {
    fn init(&self);
    fn reset(&self);
    fn exit(&self);
    fn set_root_surface(
        &self,
        id: VigsSurfaceId,
        scanout: bool,
        offset: u32,
        fence_seq: VigsFenceSeq,
    );
    /// Takes ownership of a complete batch (header included) for asynchronous execution.
    fn batch(&self, data: Vec<u8>);
}

/// Commands executed inside a batch.
pub trait BatchOps {
    fn start(&mut self);
    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: VigsSurfaceFormat,
        id: VigsSurfaceId,
    );
    fn destroy_surface(&mut self, id: VigsSurfaceId);
    fn update_vram(&mut self, sfc_id: VigsSurfaceId, offset: u32);
    fn update_gpu(&mut self, sfc_id: VigsSurfaceId, offset: u32, entries: &[VigsRect]);
    fn copy(&mut self, src_id: VigsSurfaceId, dst_id: VigsSurfaceId, entries: &[VigsCopy]);
    fn solid_fill(&mut self, sfc_id: VigsSurfaceId, color: VigsColor, entries: &[VigsRect]);
    fn set_plane(&mut self, req: &VigsCmdSetPlaneRequest);
    fn ga_copy(&mut self, req: &VigsCmdGaCopyRequest);
    fn end(&mut self, fence_seq: VigsFenceSeq);
}

pub struct Comm {
    ram: Arc<dyn GuestMemory>,
}

fn payload_offset(ram_offset: u64) -> u64 {
    ram_offset + (VigsCmdBatchHeader::SIZE_BYTES + VigsCmdRequestHeader::SIZE_BYTES) as u64
}

fn check_payload(hdr: &VigsCmdRequestHeader, expected: usize) -> Result<(), VigsDecodeError> {
    let found = hdr.size as usize;
    if found < expected {
        return Err(VigsDecodeError::PayloadSizeMismatch { expected, found });
    }
    Ok(())
}

impl Comm {
    pub fn new(ram: Arc<dyn GuestMemory>) -> Self {
        Self { ram }
    }

    pub fn ram(&self) -> &Arc<dyn GuestMemory> {
        &self.ram
    }

    fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N], ServerError> {
        let mut buf = [0u8; N];
        self.ram.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Handles the batch the guest placed at `ram_offset`.
    pub fn dispatch(&self, ram_offset: u32, ops: &dyn CommOps) -> Result<(), ServerError> {
        let offset = u64::from(ram_offset);
        let batch_hdr = decode_batch_header_le(
            &self.read_array::<{ VigsCmdBatchHeader::SIZE_BYTES }>(offset)?,
        )?;
        let (fence_seq, size) = (batch_hdr.fence_seq, batch_hdr.size);

        if size > 0 {
            let req_hdr = decode_request_header_le(
                &self.read_array::<{ VigsCmdRequestHeader::SIZE_BYTES }>(
                    offset + VigsCmdBatchHeader::SIZE_BYTES as u64,
                )?,
            )?;

            match VigsCmd::from_u32(req_hdr.cmd) {
                Some(VigsCmd::Init) => return self.dispatch_init(offset, &req_hdr, ops),
                Some(VigsCmd::Reset) => {
                    trace!("reset");
                    ops.reset();
                    return Ok(());
                }
                Some(VigsCmd::Exit) => {
                    trace!("exit");
                    ops.exit();
                    return Ok(());
                }
                Some(VigsCmd::SetRootSurface) => {
                    check_payload(&req_hdr, VigsCmdSetRootSurfaceRequest::SIZE_BYTES)?;
                    let req = decode_cmd_set_root_surface_le(
                        &self.read_array::<{ VigsCmdSetRootSurfaceRequest::SIZE_BYTES }>(
                            payload_offset(offset),
                        )?,
                    )?;
                    let VigsCmdSetRootSurfaceRequest {
                        id,
                        scanout,
                        offset: sfc_offset,
                    } = req;
                    trace!(id, scanout, offset = sfc_offset, fence_seq, "set_root_surface");
                    ops.set_root_surface(id, scanout != 0, sfc_offset, fence_seq);
                    return Ok(());
                }
                _ => {}
            }
        }

        let len = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_add(VigsCmdBatchHeader::SIZE_BYTES))
            .ok_or(VigsDecodeError::CountOverflow)?;
        if offset.saturating_add(len as u64) > self.ram.size() {
            return Err(GuestMemoryError { offset, len }.into());
        }
        let mut data = vec![0u8; len];
        self.ram.read(offset, &mut data)?;
        ops.batch(data);
        Ok(())
    }

    fn dispatch_init(
        &self,
        offset: u64,
        req_hdr: &VigsCmdRequestHeader,
        ops: &dyn CommOps,
    ) -> Result<(), ServerError> {
        check_payload(req_hdr, VigsCmdInitRequest::SIZE_BYTES)?;
        let payload = payload_offset(offset);
        let req = decode_cmd_init_le(
            &self.read_array::<{ VigsCmdInitRequest::SIZE_BYTES }>(payload)?,
        )?;

        // The guest reads the host version back from the request itself.
        let server_version_at = payload + std::mem::offset_of!(VigsCmdInitRequest, server_version) as u64;
        self.ram
            .write(server_version_at, &VIGS_PROTOCOL_VERSION.to_le_bytes())?;

        let client_version = req.client_version;
        if client_version != VIGS_PROTOCOL_VERSION {
            error!(
                expected = VIGS_PROTOCOL_VERSION,
                actual = client_version,
                "protocol version mismatch"
            );
            return Err(ServerError::ProtocolVersion {
                expected: VIGS_PROTOCOL_VERSION,
                actual: client_version,
            });
        }

        trace!(client_version, "init");
        ops.init();
        Ok(())
    }
}

/// Outcome of walking one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub fence_seq: VigsFenceSeq,
    /// Requests seen, including rejected ones.
    pub requests: u64,
    pub protocol_errors: u64,
}

enum RequestError {
    /// The request can't be trusted; nothing after it can be either.
    Framing(VigsDecodeError),
    /// The request is well formed but carries a value the host refuses.
    Rejected,
}

impl From<VigsDecodeError> for RequestError {
    fn from(err: VigsDecodeError) -> Self {
        Self::Framing(err)
    }
}

/// Executes a batch produced by [`Comm::dispatch`].
///
/// Unknown commands are logged and skipped. A framing error stops the walk. Either way
/// `ops.end(fence_seq)` runs once `ops.start()` has.
pub fn dispatch_batch(batch: &[u8], ops: &mut dyn BatchOps) -> BatchSummary {
    let mut summary = BatchSummary::default();

    let mut iter = match VigsBatchIter::new(batch) {
        Ok(iter) => iter,
        Err(err) => {
            error!(%err, len = batch.len(), "bad batch header");
            summary.protocol_errors += 1;
            return summary;
        }
    };
    let fence_seq = iter.header().fence_seq;
    summary.fence_seq = fence_seq;

    trace!("batch_start");
    ops.start();

    for packet in iter.by_ref() {
        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                error!(%err, fence_seq, "malformed request, dropping rest of batch");
                summary.protocol_errors += 1;
                break;
            }
        };
        summary.requests += 1;

        let cmd = match packet.cmd {
            Some(cmd) if cmd.is_batched() => cmd,
            _ => {
                let (cmd, size) = (packet.hdr.cmd, packet.hdr.size);
                error!(cmd, size, "bad command");
                summary.protocol_errors += 1;
                continue;
            }
        };

        match dispatch_request(cmd, packet.payload, ops) {
            Ok(()) => {}
            Err(RequestError::Rejected) => summary.protocol_errors += 1,
            Err(RequestError::Framing(err)) => {
                error!(%err, ?cmd, fence_seq, "malformed request, dropping rest of batch");
                summary.protocol_errors += 1;
                break;
            }
        }
    }

    trace!(fence_seq, "batch_end");
    ops.end(fence_seq);
    summary
}

fn dispatch_request(
    cmd: VigsCmd,
    payload: &[u8],
    ops: &mut dyn BatchOps,
) -> Result<(), RequestError> {
    match cmd {
        VigsCmd::CreateSurface => {
            let VigsCmdCreateSurfaceRequest {
                width,
                height,
                stride,
                format,
                id,
            } = decode_cmd_create_surface_le(payload)?;
            let Some(fmt) = VigsSurfaceFormat::from_u32(format) else {
                let err = ServerError::BadSurfaceFormat(format);
                error!(%err, id, "create_surface rejected");
                return Err(RequestError::Rejected);
            };
            trace!(width, height, stride, format, id, "create_surface");
            ops.create_surface(width, height, stride, fmt, id);
        }
        VigsCmd::DestroySurface => {
            let id = decode_cmd_destroy_surface_le(payload)?.id;
            trace!(id, "destroy_surface");
            ops.destroy_surface(id);
        }
        VigsCmd::UpdateVram => {
            let req = decode_cmd_update_vram_le(payload)?;
            let (sfc_id, offset) = (req.sfc_id, req.offset);
            if sfc_id == 0 {
                trace!("update_vram skipped");
                return Ok(());
            }
            trace!(sfc_id, offset, "update_vram");
            ops.update_vram(sfc_id, offset);
        }
        VigsCmd::UpdateGpu => {
            let (req, rects) = decode_cmd_update_gpu_le(payload)?;
            let (sfc_id, offset) = (req.sfc_id, req.offset);
            if sfc_id == 0 {
                trace!("update_gpu skipped");
                return Ok(());
            }
            trace!(sfc_id, offset, num_entries = rects.len(), "update_gpu");
            ops.update_gpu(sfc_id, offset, &rects);
        }
        VigsCmd::Copy => {
            let (req, entries) = decode_cmd_copy_le(payload)?;
            let (src_id, dst_id) = (req.src_id, req.dst_id);
            trace!(src_id, dst_id, num_entries = entries.len(), "copy");
            ops.copy(src_id, dst_id, &entries);
        }
        VigsCmd::SolidFill => {
            let (req, rects) = decode_cmd_solid_fill_le(payload)?;
            let (sfc_id, color) = (req.sfc_id, req.color);
            trace!(sfc_id, color = format_args!("{color:#x}"), "solid_fill");
            ops.solid_fill(sfc_id, color, &rects);
        }
        VigsCmd::SetPlane => {
            let req = decode_cmd_set_plane_le(payload)?;
            let (plane, surfaces, z_pos) = (req.plane, req.surfaces, req.z_pos);
            trace!(plane, ?surfaces, z_pos, "set_plane");
            ops.set_plane(&req);
        }
        VigsCmd::GaCopy => {
            let req = decode_cmd_ga_copy_le(payload)?;
            let (src_id, src_scanout, dst_id) = (req.src_id, req.src_scanout, req.dst_id);
            trace!(src_id, src_scanout, dst_id, "ga_copy");
            ops.ga_copy(&req);
        }
        VigsCmd::Init | VigsCmd::Reset | VigsCmd::Exit | VigsCmd::SetRootSurface => {
            return Err(RequestError::Rejected);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VecGuestMemory;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use vigs_protocol::vigs::cmd_writer::VigsCmdWriter;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Init,
        Reset,
        Exit,
        SetRoot(u32, bool, u32, u32),
        Batch(Vec<u8>),
        Start,
        Create(u32, u32, u32, VigsSurfaceFormat, u32),
        Destroy(u32),
        UpdateVram(u32, u32),
        UpdateGpu(u32, u32, usize),
        Copy(u32, u32, usize),
        Fill(u32, u32, usize),
        SetPlane(u32),
        GaCopy(u32, u32),
        End(u32),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn push(&self, ev: Event) {
            self.events.lock().unwrap().push(ev);
        }

        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl CommOps for Recorder {
        fn init(&self) {
            self.push(Event::Init);
        }
        fn reset(&self) {
            self.push(Event::Reset);
        }
        fn exit(&self) {
            self.push(Event::Exit);
        }
        fn set_root_surface(&self, id: u32, scanout: bool, offset: u32, fence_seq: u32) {
            self.push(Event::SetRoot(id, scanout, offset, fence_seq));
        }
        fn batch(&self, data: Vec<u8>) {
            self.push(Event::Batch(data));
        }
    }

    impl BatchOps for Recorder {
        fn start(&mut self) {
            self.push(Event::Start);
        }
        fn create_surface(&mut self, w: u32, h: u32, stride: u32, f: VigsSurfaceFormat, id: u32) {
            self.push(Event::Create(w, h, stride, f, id));
        }
        fn destroy_surface(&mut self, id: u32) {
            self.push(Event::Destroy(id));
        }
        fn update_vram(&mut self, sfc_id: u32, offset: u32) {
            self.push(Event::UpdateVram(sfc_id, offset));
        }
        fn update_gpu(&mut self, sfc_id: u32, offset: u32, entries: &[VigsRect]) {
            self.push(Event::UpdateGpu(sfc_id, offset, entries.len()));
        }
        fn copy(&mut self, src_id: u32, dst_id: u32, entries: &[VigsCopy]) {
            self.push(Event::Copy(src_id, dst_id, entries.len()));
        }
        fn solid_fill(&mut self, sfc_id: u32, color: u32, entries: &[VigsRect]) {
            self.push(Event::Fill(sfc_id, color, entries.len()));
        }
        fn set_plane(&mut self, req: &VigsCmdSetPlaneRequest) {
            self.push(Event::SetPlane(req.plane));
        }
        fn ga_copy(&mut self, req: &VigsCmdGaCopyRequest) {
            self.push(Event::GaCopy(req.src_id, req.dst_id));
        }
        fn end(&mut self, fence_seq: u32) {
            self.push(Event::End(fence_seq));
        }
    }

    fn comm_with(batch: &[u8], at: u64) -> (Comm, Arc<VecGuestMemory>) {
        let ram = Arc::new(VecGuestMemory::new(4096));
        ram.write(at, batch).unwrap();
        (Comm::new(ram.clone()), ram)
    }

    #[test]
    fn init_writes_server_version_in_place() {
        let mut w = VigsCmdWriter::new(0);
        w.init();
        let (comm, ram) = comm_with(&w.finish(), 64);

        let rec = Recorder::default();
        comm.dispatch(64, &rec).unwrap();
        assert_eq!(rec.take(), vec![Event::Init]);

        let version = ram.read_vec(64 + 16 + 4, 4).unwrap();
        assert_eq!(version, VIGS_PROTOCOL_VERSION.to_le_bytes().to_vec());
    }

    #[test]
    fn init_version_mismatch_still_reports_host_version() {
        let mut w = VigsCmdWriter::new(0);
        w.init_with_version(19);
        let (comm, ram) = comm_with(&w.finish(), 0);

        let rec = Recorder::default();
        assert!(matches!(
            comm.dispatch(0, &rec),
            Err(ServerError::ProtocolVersion {
                expected: 20,
                actual: 19
            })
        ));
        assert!(rec.take().is_empty());
        assert_eq!(ram.read_vec(20, 4).unwrap(), 20u32.to_le_bytes().to_vec());
    }

    #[test]
    fn leading_control_commands_run_synchronously() {
        let rec = Recorder::default();

        let mut w = VigsCmdWriter::new(9);
        w.set_root_surface(3, true, 0x1000);
        // Ignored: only the first request of a control batch is looked at.
        w.destroy_surface(3);
        let (comm, _) = comm_with(&w.finish(), 0);
        comm.dispatch(0, &rec).unwrap();

        let mut w = VigsCmdWriter::new(0);
        w.reset_cmd();
        let (reset, _) = comm_with(&w.finish(), 0);
        reset.dispatch(0, &rec).unwrap();

        let mut w = VigsCmdWriter::new(0);
        w.exit();
        let (exit, _) = comm_with(&w.finish(), 0);
        exit.dispatch(0, &rec).unwrap();

        assert_eq!(
            rec.take(),
            vec![
                Event::SetRoot(3, true, 0x1000, 9),
                Event::Reset,
                Event::Exit
            ]
        );
    }

    #[test]
    fn any_nonzero_batch_size_looks_for_a_control_command() {
        let mut batch = Vec::new();
        for word in [3u32, 1, VigsCmd::Reset as u32, 0] {
            batch.extend_from_slice(&word.to_le_bytes());
        }
        let (comm, _) = comm_with(&batch, 0);

        let rec = Recorder::default();
        comm.dispatch(0, &rec).unwrap();
        assert_eq!(rec.take(), vec![Event::Reset]);
    }

    #[test]
    fn other_batches_are_copied_whole() {
        let mut w = VigsCmdWriter::new(5);
        w.destroy_surface(1);
        w.init();
        let batch = w.finish();
        let (comm, _) = comm_with(&batch, 128);

        let rec = Recorder::default();
        comm.dispatch(128, &rec).unwrap();
        assert_eq!(rec.take(), vec![Event::Batch(batch)]);

        // An empty batch still carries its fence.
        let empty = VigsCmdWriter::new(6).finish();
        let (comm, _) = comm_with(&empty, 0);
        comm.dispatch(0, &rec).unwrap();
        assert_eq!(rec.take(), vec![Event::Batch(empty)]);
    }

    #[test]
    fn batch_past_end_of_ram_is_an_error() {
        let (comm, ram) = comm_with(&[], 0);
        ram.write(4088, &[1, 0, 0, 0, 0xFF, 0, 0, 0]).unwrap();
        let rec = Recorder::default();
        assert!(matches!(
            comm.dispatch(4088, &rec),
            Err(ServerError::Memory(_))
        ));
        assert!(comm.dispatch(4095, &rec).is_err());
        assert!(rec.take().is_empty());
    }

    #[test]
    fn batch_commands_reach_their_handlers_in_order() {
        let plane = VigsCmdSetPlaneRequest {
            plane: 1,
            ..Default::default()
        };
        let ga = VigsCmdGaCopyRequest {
            src_id: 4,
            dst_id: 2,
            ..Default::default()
        };

        let mut w = VigsCmdWriter::new(77);
        w.create_surface(4, 4, 16, VigsSurfaceFormat::Bgra8888, 2);
        w.update_gpu(2, 0, &[VigsRect::new(0, 0, 4, 4)]);
        w.solid_fill(2, 0xFF00FF00, &[VigsRect::new(0, 0, 1, 1), VigsRect::new(1, 1, 1, 1)]);
        w.copy(2, 2, &[VigsCopy::new((0, 0), (1, 1), (1, 1))]);
        w.update_vram(2, 64);
        w.set_plane(&plane);
        w.ga_copy(&ga);
        w.destroy_surface(2);

        let mut rec = Recorder::default();
        let summary = dispatch_batch(&w.finish(), &mut rec);
        assert_eq!(
            rec.take(),
            vec![
                Event::Start,
                Event::Create(4, 4, 16, VigsSurfaceFormat::Bgra8888, 2),
                Event::UpdateGpu(2, 0, 1),
                Event::Fill(2, 0xFF00FF00, 2),
                Event::Copy(2, 2, 1),
                Event::UpdateVram(2, 64),
                Event::SetPlane(1),
                Event::GaCopy(4, 2),
                Event::Destroy(2),
                Event::End(77),
            ]
        );
        assert_eq!(
            summary,
            BatchSummary {
                fence_seq: 77,
                requests: 8,
                protocol_errors: 0
            }
        );
    }

    #[test]
    fn unknown_and_misplaced_commands_are_skipped() {
        let mut w = VigsCmdWriter::new(3);
        w.destroy_surface(1);
        w.raw(0x42, &[0xAA; 12]);
        w.init();
        w.destroy_surface(2);

        let mut rec = Recorder::default();
        let summary = dispatch_batch(&w.finish(), &mut rec);
        assert_eq!(
            rec.take(),
            vec![
                Event::Start,
                Event::Destroy(1),
                Event::Destroy(2),
                Event::End(3)
            ]
        );
        assert_eq!(summary.protocol_errors, 2);
        assert_eq!(summary.requests, 4);
    }

    #[test]
    fn framing_error_drops_the_rest_but_still_ends_the_batch() {
        let mut w = VigsCmdWriter::new(8);
        w.destroy_surface(1);
        // Too short for a create_surface payload.
        w.raw(VigsCmd::CreateSurface as u32, &[0; 8]);
        w.destroy_surface(2);

        let mut rec = Recorder::default();
        let summary = dispatch_batch(&w.finish(), &mut rec);
        assert_eq!(
            rec.take(),
            vec![Event::Start, Event::Destroy(1), Event::End(8)]
        );
        assert_eq!(summary.protocol_errors, 1);

        // Request header claiming more bytes than the batch holds.
        let mut w = VigsCmdWriter::new(9);
        w.destroy_surface(1);
        let mut batch = w.finish();
        batch[12..16].copy_from_slice(&1000u32.to_le_bytes());
        let summary = dispatch_batch(&batch, &mut rec);
        assert_eq!(rec.take(), vec![Event::Start, Event::End(9)]);
        assert_eq!(summary.requests, 0);
        assert_eq!(summary.protocol_errors, 1);
    }

    #[test]
    fn zero_surface_updates_and_bad_formats_are_dropped() {
        let mut w = VigsCmdWriter::new(1);
        w.update_vram(0, 0);
        w.update_gpu(0, 0, &[]);
        w.create_surface_raw_format(1, 1, 4, 7, 5);
        w.create_surface(1, 1, 4, VigsSurfaceFormat::Bgrx8888, 6);

        let mut rec = Recorder::default();
        let summary = dispatch_batch(&w.finish(), &mut rec);
        assert_eq!(
            rec.take(),
            vec![
                Event::Start,
                Event::Create(1, 1, 4, VigsSurfaceFormat::Bgrx8888, 6),
                Event::End(1)
            ]
        );
        assert_eq!(summary.protocol_errors, 1);
    }

    #[test]
    fn empty_batch_still_brackets_and_fences() {
        let mut rec = Recorder::default();
        dispatch_batch(&VigsCmdWriter::new(12).finish(), &mut rec);
        assert_eq!(rec.take(), vec![Event::Start, Event::End(12)]);
    }
}
