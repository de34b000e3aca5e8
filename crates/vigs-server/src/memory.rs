//! Shared guest memory regions.
//!
//! The device exposes two of them: RAM, where the guest writes command batches, and the
//! VRAM-mirror, used for CPU-visible pixel transfer and scanout. The real emulator backs these
//! with its memory system; [`VecGuestMemory`] is the in-process implementation.

use std::sync::{PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("guest memory access out of bounds: offset=0x{offset:x}, len=0x{len:x}")]
pub struct GuestMemoryError {
    pub offset: u64,
    pub len: usize,
}

/// Byte-addressed view of one shared region.
pub trait GuestMemory: Send + Sync {
    fn size(&self) -> u64;
    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
    fn write(&self, offset: u64, src: &[u8]) -> Result<(), GuestMemoryError>;
}

#[derive(Debug)]
pub struct VecGuestMemory {
    mem: RwLock<Vec<u8>>,
}

impl VecGuestMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            mem: RwLock::new(vec![0u8; size_bytes]),
        }
    }

    /// Copy of `len` bytes at `offset`.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, GuestMemoryError> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }
}

fn range(offset: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>, GuestMemoryError> {
    let err = GuestMemoryError { offset, len };
    let start = usize::try_from(offset).map_err(|_| err.clone())?;
    let end = start.checked_add(len).ok_or_else(|| err.clone())?;
    if end > size {
        return Err(err);
    }
    Ok(start..end)
}

impl GuestMemory for VecGuestMemory {
    fn size(&self) -> u64 {
        self.mem.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mem = self.mem.read().unwrap_or_else(PoisonError::into_inner);
        let range = range(offset, dst.len(), mem.len())?;
        dst.copy_from_slice(&mem[range]);
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut mem = self.mem.write().unwrap_or_else(PoisonError::into_inner);
        let range = range(offset, src.len(), mem.len())?;
        mem[range].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let mem = VecGuestMemory::new(16);
        mem.write(12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_vec(12, 4).unwrap(), vec![1, 2, 3, 4]);

        assert_eq!(
            mem.write(13, &[0; 4]),
            Err(GuestMemoryError { offset: 13, len: 4 })
        );
        let mut buf = [0u8; 2];
        assert!(mem.read(u64::MAX, &mut buf).is_err());
    }
}
