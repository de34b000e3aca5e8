use std::sync::{Arc, Barrier};
use std::thread;

use pretty_assertions::assert_eq;
use vigs_protocol::vigs::cmd_writer::VigsCmdWriter;
use vigs_protocol::vigs::vigs_cmd::{
    VigsCmd, VigsCmdGaCopyRequest, VigsCopy, VigsRect, VigsSurfaceFormat, VIGS_PROTOCOL_VERSION,
};
use vigs_server::backend::sw::SwBackend;
use vigs_server::{BufferDisplay, GuestMemory, Server, VecGuestMemory};

struct Device {
    server: Server,
    ram: Arc<VecGuestMemory>,
    vram: Arc<VecGuestMemory>,
    display: Arc<BufferDisplay>,
}

fn device() -> Device {
    let ram = Arc::new(VecGuestMemory::new(1 << 20));
    let vram = Arc::new(VecGuestMemory::new(1 << 20));
    let display = Arc::new(BufferDisplay::new(4));
    let server = Server::new(
        Box::new(SwBackend::new()),
        vram.clone(),
        ram.clone(),
        display.clone(),
    )
    .unwrap();
    Device {
        server,
        ram,
        vram,
        display,
    }
}

impl Device {
    fn submit_at(&self, offset: u32, batch: &[u8]) {
        self.ram.write(u64::from(offset), batch).unwrap();
        self.server.dispatch(offset);
    }

    fn submit(&self, w: VigsCmdWriter) {
        self.submit_at(0, &w.finish());
    }

    fn init(&self) {
        let mut w = VigsCmdWriter::new(0);
        w.init();
        self.submit(w);
    }
}

#[test]
fn init_reports_host_version_even_on_mismatch() {
    let dev = device();
    let mut w = VigsCmdWriter::new(0);
    w.init_with_version(VIGS_PROTOCOL_VERSION - 1);
    dev.submit_at(0x100, &w.finish());

    // batch header (8) + request header (8) + client_version (4)
    let server_version = dev.ram.read_vec(0x100 + 20, 4).unwrap();
    assert_eq!(server_version, VIGS_PROTOCOL_VERSION.to_le_bytes().to_vec());
    assert!(!dev.server.is_initialized());
    assert_eq!(dev.server.stats().protocol_errors, 1);

    let mut w = VigsCmdWriter::new(0);
    w.init();
    dev.submit_at(0x100, &w.finish());
    assert!(dev.server.is_initialized());
}

#[test]
fn unknown_and_misplaced_commands_are_skipped() {
    let dev = device();
    dev.init();

    let mut w = VigsCmdWriter::new(9);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgra8888, 1);
    w.raw(0x42, &[0xAA; 12]);
    w.raw(VigsCmd::Exit as u32, &[]);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgra8888, 2);
    dev.submit(w);
    dev.server.wait_idle();

    assert_eq!(dev.server.surface_count(), 2);
    assert!(dev.server.is_initialized());
    assert_eq!(dev.display.acks(), vec![9]);
    let stats = dev.server.stats();
    assert_eq!(stats.requests, 4);
    assert_eq!(stats.protocol_errors, 2);
}

#[test]
fn bad_surface_format_is_rejected() {
    let dev = device();
    dev.init();

    let mut w = VigsCmdWriter::new(0);
    w.create_surface_raw_format(2, 2, 8, 7, 1);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgrx8888, 2);
    dev.submit(w);
    dev.server.wait_idle();

    assert!(dev.server.acquire_surface(1).is_none());
    assert!(dev.server.acquire_surface(2).is_some());
}

#[test]
fn truncated_request_drops_the_rest_of_the_batch() {
    let dev = device();
    dev.init();

    let mut w = VigsCmdWriter::new(5);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgrx8888, 1);
    // create_surface needs 20 payload bytes.
    w.raw(VigsCmd::CreateSurface as u32, &[0; 8]);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgrx8888, 2);
    dev.submit(w);
    dev.server.wait_idle();

    assert_eq!(dev.server.surface_count(), 1);
    assert_eq!(dev.display.acks(), vec![5]);
}

#[test]
fn batch_past_end_of_ram_is_refused() {
    let dev = device();
    dev.init();

    let mut batch = Vec::new();
    batch.extend_from_slice(&3u32.to_le_bytes());
    batch.extend_from_slice(&u32::MAX.to_le_bytes());
    batch.extend_from_slice(&(VigsCmd::CreateSurface as u32).to_le_bytes());
    batch.extend_from_slice(&20u32.to_le_bytes());
    dev.submit_at(0x800, &batch);
    dev.server.wait_idle();

    assert_eq!(dev.display.acks(), Vec::<u32>::new());
    assert_eq!(dev.server.stats().batches, 0);
}

#[test]
fn empty_batch_still_acks_its_fence() {
    let dev = device();
    dev.submit(VigsCmdWriter::new(77));
    dev.server.wait_idle();
    assert_eq!(dev.display.acks(), vec![77]);
}

#[test]
fn scroll_by_one_row_within_a_surface() {
    let dev = device();
    dev.init();

    let rows: Vec<u8> = (0u8..4).flat_map(|r| [r; 8]).collect();
    dev.vram.write(0, &rows).unwrap();

    let mut w = VigsCmdWriter::new(0);
    w.create_surface(2, 4, 8, VigsSurfaceFormat::Bgra8888, 1);
    w.update_gpu(1, 0, &[VigsRect::new(0, 0, 2, 4)]);
    w.copy(1, 1, &[VigsCopy::new((0, 0), (0, 1), (2, 3))]);
    w.update_vram(1, 0x100);
    dev.submit(w);
    dev.server.wait_idle();

    let expected: Vec<u8> = [0u8, 0, 1, 2].iter().flat_map(|&r| [r; 8]).collect();
    assert_eq!(dev.vram.read_vec(0x100, 32).unwrap(), expected);
}

#[test]
fn ga_copy_with_overflowing_source_is_skipped_and_fenced() {
    let dev = device();
    dev.init();

    let mut w = VigsCmdWriter::new(7);
    w.create_surface(2, 2, 8, VigsSurfaceFormat::Bgrx8888, 1);
    w.ga_copy(&VigsCmdGaCopyRequest {
        src_scanout: 1,
        src_offset: u32::MAX,
        src_stride: u32::MAX,
        dst_id: 1,
        dst_stride: 8,
        entry: VigsCopy::new((u32::MAX, u32::MAX), (0, 0), (1, 2)),
        ..Default::default()
    });
    w.update_vram(1, 0x400);
    dev.submit(w);
    dev.server.wait_idle();

    assert_eq!(dev.display.acks(), vec![7]);
    assert_eq!(dev.vram.read_vec(0x400, 16).unwrap(), vec![0u8; 16]);
}

#[test]
fn short_batch_with_a_leading_init_is_still_a_control_command() {
    let dev = device();

    // The batch header claims 4 bytes, less than a full request header.
    let mut batch = Vec::new();
    batch.extend_from_slice(&0u32.to_le_bytes());
    batch.extend_from_slice(&4u32.to_le_bytes());
    batch.extend_from_slice(&(VigsCmd::Init as u32).to_le_bytes());
    batch.extend_from_slice(&8u32.to_le_bytes());
    batch.extend_from_slice(&VIGS_PROTOCOL_VERSION.to_le_bytes());
    batch.extend_from_slice(&0u32.to_le_bytes());
    dev.submit_at(0x200, &batch);

    assert!(dev.server.is_initialized());
    assert_eq!(
        dev.ram.read_vec(0x200 + 20, 4).unwrap(),
        VIGS_PROTOCOL_VERSION.to_le_bytes().to_vec()
    );
}

#[test]
fn concurrent_submitters_get_every_fence_acked() {
    let dev = Arc::new(device());
    dev.init();

    const THREADS: u32 = 4;
    const BATCHES: u32 = 25;
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let dev = Arc::clone(&dev);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..BATCHES {
                    let id = t * BATCHES + i + 1;
                    let mut w = VigsCmdWriter::new(id);
                    w.create_surface(1, 1, 4, VigsSurfaceFormat::Bgrx8888, id);
                    dev.submit_at(t * 0x1000, &w.finish());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    dev.server.wait_idle();

    let mut acks = dev.display.acks();
    acks.sort_unstable();
    assert_eq!(acks, (1..=THREADS * BATCHES).collect::<Vec<_>>());
    assert_eq!(dev.server.surface_count(), (THREADS * BATCHES) as usize);
}

mod surface_table {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Clone, Debug)]
    enum Op {
        Create(u32),
        Destroy(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(1u32..8).prop_map(Op::Create), (1u32..8).prop_map(Op::Destroy)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn count_tracks_live_ids(ops in proptest::collection::vec(op(), 0..40)) {
            let dev = device();
            dev.init();

            let mut live = BTreeSet::new();
            let mut w = VigsCmdWriter::new(1);
            for op in &ops {
                match *op {
                    Op::Create(id) => {
                        w.create_surface(1, 1, 4, VigsSurfaceFormat::Bgrx8888, id);
                        live.insert(id);
                    }
                    Op::Destroy(id) => {
                        w.destroy_surface(id);
                        live.remove(&id);
                    }
                }
            }
            dev.submit(w);
            dev.server.wait_idle();

            prop_assert_eq!(dev.server.surface_count(), live.len());
            for id in 1u32..8 {
                prop_assert_eq!(dev.server.acquire_surface(id).is_some(), live.contains(&id));
            }
        }
    }
}
