use std::collections::VecDeque;

/// Bounded byte history with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_written: 0,
        }
    }

    /// Append `data`, dropping the oldest bytes once over capacity.
    pub fn push(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Current contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes ever pushed, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn evicted(&self) -> u64 {
        self.total_written - self.buf.len() as u64
    }
}
