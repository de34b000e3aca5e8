use pretty_assertions::assert_eq;
use proptest::prelude::*;
use vigs_protocol::vigs::cmd_writer::VigsCmdWriter;
use vigs_protocol::vigs::vigs_cmd::{
    decode_cmd_copy_le, decode_cmd_create_surface_le, decode_cmd_ga_copy_le, decode_cmd_init_le,
    decode_cmd_set_plane_le, decode_cmd_solid_fill_le, VigsBatchIter, VigsCmd,
    VigsCmdGaCopyRequest, VigsCmdSetPlaneRequest, VigsCopy, VigsDecodeError, VigsRect, VigsSize,
    VigsSurfaceFormat, VIGS_PROTOCOL_VERSION,
};

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[test]
fn iterates_writer_batch_in_order() {
    let mut w = VigsCmdWriter::new(7);
    w.create_surface(64, 32, 256, VigsSurfaceFormat::Bgra8888, 3);
    w.solid_fill(3, 0x1122_3344, &[VigsRect::new(1, 2, 3, 4), VigsRect::new(0, 0, 64, 32)]);
    w.copy(3, 3, &[VigsCopy::new((0, 0), (0, 1), (64, 31))]);
    w.destroy_surface(3);
    let batch = w.finish();

    let iter = VigsBatchIter::new(&batch).unwrap();
    let fence_seq = iter.header().fence_seq;
    assert_eq!(fence_seq, 7);

    let packets = iter.collect::<Result<Vec<_>, _>>().unwrap();
    let cmds: Vec<_> = packets.iter().map(|p| p.cmd).collect();
    assert_eq!(
        cmds,
        vec![
            Some(VigsCmd::CreateSurface),
            Some(VigsCmd::SolidFill),
            Some(VigsCmd::Copy),
            Some(VigsCmd::DestroySurface),
        ]
    );

    let create = decode_cmd_create_surface_le(packets[0].payload).unwrap();
    let (width, stride, format, id) = (create.width, create.stride, create.format, create.id);
    assert_eq!((width, stride, format, id), (64, 256, 1, 3));

    let (fill, rects) = decode_cmd_solid_fill_le(packets[1].payload).unwrap();
    let color = fill.color;
    assert_eq!(color, 0x1122_3344);
    assert_eq!(rects, vec![VigsRect::new(1, 2, 3, 4), VigsRect::new(0, 0, 64, 32)]);

    let (copy, entries) = decode_cmd_copy_le(packets[2].payload).unwrap();
    let (src_id, dst_id) = (copy.src_id, copy.dst_id);
    assert_eq!((src_id, dst_id), (3, 3));
    assert_eq!(entries, vec![VigsCopy::new((0, 0), (0, 1), (64, 31))]);
}

#[test]
fn unknown_command_is_yielded_with_its_payload() {
    let mut w = VigsCmdWriter::new(0);
    w.raw(0x77, &[1, 2, 3, 4, 5]);
    w.destroy_surface(9);
    let batch = w.finish();

    let packets = VigsBatchIter::new(&batch)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].cmd, None);
    assert_eq!(packets[0].payload, &[1, 2, 3, 4, 5]);
    assert_eq!(packets[1].cmd, Some(VigsCmd::DestroySurface));
}

#[test]
fn request_overrunning_batch_stops_iteration() {
    let mut batch = Vec::new();
    push_u32(&mut batch, 1); // fence_seq
    push_u32(&mut batch, 0); // size (patched below)
    push_u32(&mut batch, VigsCmd::DestroySurface as u32);
    push_u32(&mut batch, 4);
    push_u32(&mut batch, 5);
    push_u32(&mut batch, VigsCmd::DestroySurface as u32);
    push_u32(&mut batch, 400); // claims far more than the batch holds
    push_u32(&mut batch, 6);
    let size = (batch.len() - 8) as u32;
    batch[4..8].copy_from_slice(&size.to_le_bytes());

    let mut iter = VigsBatchIter::new(&batch).unwrap();
    assert!(iter.next().unwrap().is_ok());
    assert_eq!(
        iter.next().unwrap().unwrap_err(),
        VigsDecodeError::RequestOverrunsBatch {
            offset: 12,
            request_size_bytes: 400,
            batch_size_bytes: size,
        }
    );
    assert!(iter.next().is_none());
}

#[test]
fn batch_shorter_than_declared_size_is_rejected() {
    let mut batch = Vec::new();
    push_u32(&mut batch, 1);
    push_u32(&mut batch, 64);
    assert!(matches!(
        VigsBatchIter::new(&batch),
        Err(VigsDecodeError::BufferTooSmall)
    ));
}

#[test]
fn init_carries_client_version() {
    let mut w = VigsCmdWriter::new(0);
    w.init();
    let batch = w.finish();
    let packet = VigsBatchIter::new(&batch).unwrap().next().unwrap().unwrap();
    assert_eq!(packet.cmd, Some(VigsCmd::Init));
    let init = decode_cmd_init_le(packet.payload).unwrap();
    let client_version = init.client_version;
    assert_eq!(client_version, VIGS_PROTOCOL_VERSION);
}

#[test]
fn set_plane_and_ga_copy_decode_what_writer_encodes() {
    let plane = VigsCmdSetPlaneRequest {
        plane: 1,
        width: 320,
        height: 240,
        format: 2,
        surfaces: [4, 5, 0, 0],
        src_rect: VigsRect::new(0, 0, 320, 240),
        dst_x: -16,
        dst_y: 8,
        dst_size: VigsSize { w: 640, h: 480 },
        z_pos: -1,
        hflip: 1,
        vflip: 0,
        rotation: 3,
    };
    let ga = VigsCmdGaCopyRequest {
        src_id: 0,
        src_scanout: 1,
        src_offset: 0x1000,
        src_stride: 1024,
        dst_id: 9,
        dst_stride: 512,
        entry: VigsCopy::new((1, 2), (3, 4), (5, 6)),
    };

    let mut w = VigsCmdWriter::new(0);
    w.set_plane(&plane);
    w.ga_copy(&ga);
    let batch = w.finish();
    let packets = VigsBatchIter::new(&batch)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(decode_cmd_set_plane_le(packets[0].payload).unwrap(), plane);
    assert_eq!(decode_cmd_ga_copy_le(packets[1].payload).unwrap(), ga);
}

proptest! {
    #[test]
    fn arbitrary_batches_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(iter) = VigsBatchIter::new(&bytes) {
            for packet in iter {
                let Ok(packet) = packet else { break };
                let _ = decode_cmd_copy_le(packet.payload);
                let _ = decode_cmd_solid_fill_le(packet.payload);
                let _ = decode_cmd_set_plane_le(packet.payload);
            }
        }
    }
}
