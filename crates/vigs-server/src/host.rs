//! Device-level facade: guest memory, backend, server and fence bookkeeping wired together.
//!
//! This is what an emulator's register layer talks to. A dispatch register write becomes
//! [`VigsHost::dispatch`], the fence registers read [`VigsHost::fence_lower`] and
//! [`VigsHost::fence_upper`], and the display refresh timer calls [`VigsHost::update_display`].

use std::sync::Arc;

use tracing::{debug, info};
use vigs_protocol::vigs::vigs_cmd::VigsFenceSeq;

use crate::backend::gl::{GlBackend, GlContext};
use crate::backend::sw::SwBackend;
use crate::backend::Backend;
use crate::config::{BackendKind, VigsConfig};
use crate::display::DisplaySink;
use crate::error::ServerError;
use crate::fence::FenceManager;
use crate::memory::VecGuestMemory;
use crate::server::Server;

/// Told whenever the set of acked-but-unread fences changes; a device raises its IRQ here.
pub trait FenceNotifier: Send + Sync {
    fn notify(&self, pending: bool);
}

impl<F> FenceNotifier for F
where
    F: Fn(bool) + Send + Sync,
{
    fn notify(&self, pending: bool) {
        self(pending)
    }
}

/// Routes fence acks into the [`FenceManager`]; everything else goes to the real display.
struct FenceForwardingDisplay {
    inner: Arc<dyn DisplaySink>,
    fences: Arc<FenceManager>,
    notifier: Arc<dyn FenceNotifier>,
}

impl DisplaySink for FenceForwardingDisplay {
    fn resize(&self, width: u32, height: u32) {
        self.inner.resize(width, height);
    }

    fn stride(&self) -> u32 {
        self.inner.stride()
    }

    fn bpp(&self) -> u32 {
        self.inner.bpp()
    }

    fn with_data(&self, f: &mut dyn FnMut(&mut [u8])) {
        self.inner.with_data(f);
    }

    fn fence_ack(&self, fence_seq: VigsFenceSeq) {
        self.fences.ack(fence_seq);
        self.inner.fence_ack(fence_seq);
        self.notifier.notify(self.fences.pending());
    }
}

pub struct VigsHost {
    config: VigsConfig,
    vram: Arc<VecGuestMemory>,
    ram: Arc<VecGuestMemory>,
    fences: Arc<FenceManager>,
    server: Server,
}

impl VigsHost {
    /// Creates a host with the software backend. Fails if `config` asks for GL.
    pub fn new(
        config: VigsConfig,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn FenceNotifier>,
    ) -> Result<Self, ServerError> {
        match config.backend {
            BackendKind::Software => Self::build(config, Box::new(SwBackend::new()), display, notifier),
            BackendKind::Gl => Err(ServerError::GlContextRequired),
        }
    }

    /// Creates a host that renders through `ctx` when `config` selects GL.
    pub fn with_gl<C: GlContext>(
        config: VigsConfig,
        ctx: Arc<C>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn FenceNotifier>,
    ) -> Result<Self, ServerError> {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Software => Box::new(SwBackend::new()),
            BackendKind::Gl => Box::new(GlBackend::new(ctx)?),
        };
        Self::build(config, backend, display, notifier)
    }

    fn build(
        config: VigsConfig,
        backend: Box<dyn Backend>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn FenceNotifier>,
    ) -> Result<Self, ServerError> {
        let config = config.normalized();
        let vram = Arc::new(VecGuestMemory::new(config.vram_size as usize));
        let ram = Arc::new(VecGuestMemory::new(config.ram_size as usize));
        let fences = Arc::new(FenceManager::new());

        let display = Arc::new(FenceForwardingDisplay {
            inner: display,
            fences: Arc::clone(&fences),
            notifier,
        });

        info!(
            backend = backend.name(),
            vram_size = config.vram_size,
            ram_size = config.ram_size,
            "VIGS host created"
        );

        let server = Server::new(backend, vram.clone(), ram.clone(), display)?;
        Ok(Self {
            config,
            vram,
            ram,
            fences,
            server,
        })
    }

    pub fn config(&self) -> &VigsConfig {
        &self.config
    }

    /// Shared RAM the guest places batches in.
    pub fn ram(&self) -> &Arc<VecGuestMemory> {
        &self.ram
    }

    /// The VRAM-mirror region used for pixel transfers.
    pub fn vram(&self) -> &Arc<VecGuestMemory> {
        &self.vram
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn dispatch(&self, ram_offset: u32) {
        self.server.dispatch(ram_offset);
    }

    pub fn update_display(&self) -> Result<(), ServerError> {
        self.server.update_display()
    }

    /// Pops the oldest completed fence range and returns its lower bound, 0 if none.
    pub fn fence_lower(&self) -> VigsFenceSeq {
        self.fences.get_lower()
    }

    /// Upper bound of the range most recently popped by [`VigsHost::fence_lower`].
    pub fn fence_upper(&self) -> VigsFenceSeq {
        self.fences.get_upper()
    }

    /// Device reset: forgets fences the guest has not read yet.
    pub fn reset(&self) {
        debug!("device reset");
        self.fences.reset();
    }
}
