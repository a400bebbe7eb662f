//! Fixed-capacity byte ring buffer backing the network TX/RX paths (`§3`,
//! `§4.6`, `§8`).
//!
//! Grounded directly on the original `NetBuffer_*` family: a backing byte
//! array with read/write indices and an occupancy count, wraparound done
//! with (at most) two copies, and a sticky overflow latch cleared only by
//! `reset`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetBufError {
    #[error("write of {requested} bytes exceeds {available} free bytes")]
    Overflow { requested: usize, available: usize },
    #[error("read of {requested} bytes exceeds {available} buffered bytes")]
    Underflow { requested: usize, available: usize },
}

impl ecu_error::ClassifiedError for NetBufError {
    fn kind(&self) -> ecu_error::ErrorKind {
        match self {
            NetBufError::Overflow { .. } => ecu_error::ErrorKind::Transient,
            NetBufError::Underflow { .. } => ecu_error::ErrorKind::Transient,
        }
    }
}

/// A byte-oriented circular FIFO of fixed capacity, allocated once at init.
pub struct NetBuffer {
    data: Vec<u8>,
    capacity: usize,
    read_index: usize,
    write_index: usize,
    count: usize,
    overflow: bool,
}

impl NetBuffer {
    pub fn new(capacity: usize) -> Self {
        NetBuffer {
            data: vec![0; capacity],
            capacity,
            read_index: 0,
            write_index: 0,
            count: 0,
            overflow: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn free(&self) -> usize {
        self.capacity - self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflow
    }

    /// Zeroes indices, count, and the overflow latch, and (for safety)
    /// clears the backing bytes.
    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
        self.read_index = 0;
        self.write_index = 0;
        self.count = 0;
        self.overflow = false;
    }

    /// Writes `data`, wrapping around the end of the backing array. Rejects
    /// and latches `overflow` atomically if there isn't enough free space;
    /// no partial write ever occurs.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), NetBufError> {
        if bytes.len() > self.free() {
            self.overflow = true;
            return Err(NetBufError::Overflow {
                requested: bytes.len(),
                available: self.free(),
            });
        }
        let first_chunk = (self.capacity - self.write_index).min(bytes.len());
        self.data[self.write_index..self.write_index + first_chunk]
            .copy_from_slice(&bytes[..first_chunk]);
        let remaining = bytes.len() - first_chunk;
        if remaining > 0 {
            self.data[..remaining].copy_from_slice(&bytes[first_chunk..]);
        }
        self.write_index = (self.write_index + bytes.len()) % self.capacity;
        self.count += bytes.len();
        Ok(())
    }

    /// Reads `out.len()` bytes, advancing `read_index`. Rejects (leaving the
    /// buffer untouched) if fewer bytes are buffered than requested.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), NetBufError> {
        if out.len() > self.count {
            return Err(NetBufError::Underflow {
                requested: out.len(),
                available: self.count,
            });
        }
        self.copy_out(self.read_index, out);
        self.read_index = (self.read_index + out.len()) % self.capacity.max(1);
        self.count -= out.len();
        Ok(())
    }

    /// Like `read`, but does not advance `read_index` or decrement `count`.
    pub fn peek(&self, out: &mut [u8]) -> Result<(), NetBufError> {
        if out.len() > self.count {
            return Err(NetBufError::Underflow {
                requested: out.len(),
                available: self.count,
            });
        }
        self.copy_out(self.read_index, out);
        Ok(())
    }

    fn copy_out(&self, start: usize, out: &mut [u8]) {
        if self.capacity == 0 {
            return;
        }
        let first_chunk = (self.capacity - start).min(out.len());
        out[..first_chunk].copy_from_slice(&self.data[start..start + first_chunk]);
        let remaining = out.len() - first_chunk;
        if remaining > 0 {
            out[first_chunk..].copy_from_slice(&self.data[..remaining]);
        }
    }
}
