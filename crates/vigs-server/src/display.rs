//! Host display surface the captured root surface is presented to.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Destination of [`crate::server::Server::update_display`] and of fence acks.
pub trait DisplaySink: Send + Sync {
    /// Resizes the display to `width x height` pixels; a no-op when unchanged.
    fn resize(&self, width: u32, height: u32);

    fn stride(&self) -> u32;

    /// Bytes per pixel.
    fn bpp(&self) -> u32;

    /// Runs `f` over the display pixels (`stride * height` bytes).
    fn with_data(&self, f: &mut dyn FnMut(&mut [u8]));

    /// Signals that the batch or capture carrying `fence_seq` completed.
    fn fence_ack(&self, fence_seq: u32);
}

#[derive(Debug, Default)]
struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// In-memory display: a tightly packed framebuffer plus a log of fence acks.
#[derive(Debug)]
pub struct BufferDisplay {
    bpp: u32,
    frame: Mutex<Frame>,
    acks: Mutex<Vec<u32>>,
}

impl BufferDisplay {
    pub fn new(bpp: u32) -> Self {
        Self {
            bpp,
            frame: Mutex::new(Frame::default()),
            acks: Mutex::new(Vec::new()),
        }
    }

    fn frame(&self) -> MutexGuard<'_, Frame> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> (u32, u32) {
        let frame = self.frame();
        (frame.width, frame.height)
    }

    /// Copy of the current pixels.
    pub fn pixels(&self) -> Vec<u8> {
        self.frame().data.clone()
    }

    /// Fence acks received so far, in arrival order.
    pub fn acks(&self) -> Vec<u32> {
        self.acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DisplaySink for BufferDisplay {
    fn resize(&self, width: u32, height: u32) {
        let mut frame = self.frame();
        if frame.width == width && frame.height == height {
            return;
        }
        let len = width as usize * height as usize * self.bpp as usize;
        frame.width = width;
        frame.height = height;
        frame.data = vec![0u8; len];
    }

    fn stride(&self) -> u32 {
        self.frame().width * self.bpp
    }

    fn bpp(&self) -> u32 {
        self.bpp
    }

    fn with_data(&self, f: &mut dyn FnMut(&mut [u8])) {
        f(&mut self.frame().data);
    }

    fn fence_ack(&self, fence_seq: u32) {
        self.acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fence_seq);
    }
}
