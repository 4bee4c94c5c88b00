// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host memory shared by the emulated controller and the host-side driver.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

#[derive(Debug, Error)]
#[error("host memory access of {len:#x} bytes at {addr:#x} is out of range")]
pub struct MemoryError {
    addr: u64,
    len: usize,
}

/// A flat, byte-addressed region of host memory. Clones share the same
/// backing storage.
#[derive(Clone)]
pub struct HostMemory {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.len())
            .finish()
    }
}

impl HostMemory {
    /// Allocates `len` bytes of zeroed memory.
    pub fn allocate(len: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0; len])),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let bytes = self.bytes.read();
        let range = checked_range(bytes.len(), addr, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.write();
        let range = checked_range(bytes.len(), addr, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn zero(&self, addr: u64, len: usize) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.write();
        let range = checked_range(bytes.len(), addr, len)?;
        bytes[range].fill(0);
        Ok(())
    }

    pub fn read_plain<T: IntoBytes + FromBytes>(&self, addr: u64) -> Result<T, MemoryError> {
        let mut value = T::new_zeroed();
        self.read_at(addr, value.as_mut_bytes())?;
        Ok(value)
    }

    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), MemoryError> {
        self.write_at(addr, value.as_bytes())
    }
}

fn checked_range(
    total: usize,
    addr: u64,
    len: usize,
) -> Result<std::ops::Range<usize>, MemoryError> {
    usize::try_from(addr)
        .ok()
        .and_then(|start| Some(start..start.checked_add(len)?))
        .filter(|range| range.end <= total)
        .ok_or(MemoryError { addr, len })
}
