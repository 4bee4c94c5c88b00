// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-internal buffers whose space is held until a scheduled internal
//! operation completes.

use parking_lot::Mutex;
use std::sync::Arc;

/// Space that an I/O worker hands back when the request holding it retires.
pub trait ReleasableBuffer: Send {
    fn release(self: Box<Self>);
}

/// A byte-counted device write buffer, such as the staging area in front of
/// slower media.
#[derive(Debug)]
pub struct WriteBuffer {
    capacity: u64,
    used: Mutex<u64>,
}

impl WriteBuffer {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: Mutex::new(0),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    /// Reserves `bytes`, or returns `None` if they do not fit.
    pub fn allocate(self: &Arc<Self>, bytes: u64) -> Option<WriteBufferLease> {
        let mut used = self.used.lock();
        if self.capacity - *used < bytes {
            return None;
        }
        *used += bytes;
        Some(WriteBufferLease {
            buffer: self.clone(),
            bytes,
        })
    }
}

/// Space reserved in a [`WriteBuffer`]. Returned by [`ReleasableBuffer::release`].
#[derive(Debug)]
#[must_use]
pub struct WriteBufferLease {
    buffer: Arc<WriteBuffer>,
    bytes: u64,
}

impl WriteBufferLease {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl ReleasableBuffer for WriteBufferLease {
    fn release(self: Box<Self>) {
        let mut used = self.buffer.used.lock();
        *used -= self.bytes;
    }
}
