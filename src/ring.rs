//! Receive store: fixed-capacity circular buffer fed by the read pump.

/// Circular byte buffer holding data received on the bulk-in pipe that no
/// read request has consumed yet.
///
/// Only ever touched with the device lock held.
#[derive(Debug)]
pub(crate) struct RxStore {
    buf: Box<[u8]>,
    /// Index of the oldest byte
    offset: usize,
    /// Number of valid bytes starting at `offset`
    occupied: usize,
}

impl RxStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
            occupied: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub(crate) fn free(&self) -> usize {
        self.capacity() - self.occupied
    }

    /// Append as much of `data` as fits, returning the number of bytes stored.
    /// Anything past the free space is dropped.
    pub(crate) fn put(&mut self, data: &[u8]) -> usize {
        let cap = self.capacity();
        let count = data.len().min(self.free());
        if count == 0 {
            return 0;
        }

        let tail = (self.offset + self.occupied) % cap;
        let first = count.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        // Wrapped part
        let rest = count - first;
        self.buf[..rest].copy_from_slice(&data[first..count]);

        self.occupied += count;
        count
    }

    /// Move up to `out.len()` bytes into `out`, returning how many were copied.
    pub(crate) fn get(&mut self, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let count = out.len().min(self.occupied);
        if count == 0 {
            return 0;
        }

        let first = count.min(cap - self.offset);
        out[..first].copy_from_slice(&self.buf[self.offset..self.offset + first]);
        let rest = count - first;
        out[first..count].copy_from_slice(&self.buf[..rest]);

        self.offset = (self.offset + count) % cap;
        self.occupied -= count;
        if self.occupied == 0 {
            self.offset = 0;
        }
        count
    }

    /// Drop everything, returning the number of bytes discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.occupied;
        self.offset = 0;
        self.occupied = 0;
        discarded
    }
}
