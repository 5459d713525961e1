//! Transaction-scoped byte arena.
//!
//! Every key or value the transaction captures from a caller, and every
//! byte buffer a remote read produces, is copied once into the arena and
//! handed around as a cheap [`Bytes`] slice from then on. Slices stay valid
//! for at least the lifetime of the transaction; `clear` is called only on
//! transaction reset, which also discards every structure that could hold
//! an arena slice.

use bytes::{Bytes, BytesMut};

const INITIAL_CHUNK: usize = 4 * 1024;
const MAX_CHUNK: usize = 256 * 1024;

/// Append-only allocator backing one transaction.
#[derive(Debug)]
pub struct Arena {
    current: BytesMut,
    chunk_size: usize,
    allocated: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            current: BytesMut::new(),
            chunk_size: INITIAL_CHUNK,
            allocated: 0,
        }
    }

    /// Copies `data` into the arena and returns a stable slice of it.
    pub fn alloc(&mut self, data: &[u8]) -> Bytes {
        if self.current.capacity() - self.current.len() < data.len() {
            let want = self.chunk_size.max(data.len());
            self.current = BytesMut::with_capacity(want);
            if self.chunk_size < MAX_CHUNK {
                self.chunk_size *= 2;
            }
        }
        self.current.extend_from_slice(data);
        self.allocated += data.len();
        self.current.split().freeze()
    }

    /// Total bytes handed out since creation or the last `clear`.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Drops the arena's backing storage and resets accounting.
    ///
    /// Outstanding slices keep their own backing alive; the contract is
    /// that the transaction discards every structure holding them in the
    /// same reset.
    pub fn clear(&mut self) {
        self.current = BytesMut::new();
        self.chunk_size = INITIAL_CHUNK;
        self.allocated = 0;
    }
}
