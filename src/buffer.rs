use std::cmp;

/// Produces writable byte regions for the read path.
///
/// The event loop asks its predictor for a capacity and the allocator for
/// the region. Implementations may pool; the default allocates fresh heap
/// buffers.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, cap: usize) -> Vec<u8>;
}

/// Plain heap allocation, zero-filled.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, cap: usize) -> Vec<u8> {
        vec![0; cap]
    }
}

/// An outbound payload with a read cursor.
///
/// Queued writes drain in chunks; the cursor records how far transmission
/// got so a partially written buffer can stay at the head of the queue.
#[derive(Debug)]
pub struct WriteBuf {
    data: Vec<u8>,
    pos: usize,
}

impl WriteBuf {
    pub fn new(data: Vec<u8>) -> WriteBuf {
        WriteBuf { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// The untransmitted bytes.
    #[inline]
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// The untransmitted bytes, capped at `quota`.
    #[inline]
    pub fn chunk_up_to(&self, quota: usize) -> &[u8] {
        let end = self.pos + cmp::min(self.remaining(), quota);
        &self.data[self.pos..end]
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.pos += n;
    }

    /// The full original payload, regardless of cursor position.
    pub fn into_payload(self) -> Vec<u8> {
        self.data
    }
}
