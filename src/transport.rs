//! USB transfer service consumed by the serial core.
//!
//! The core never talks to a USB stack directly. It submits transfers on one
//! of three pipes and is called back once per transfer, from whatever thread
//! the implementation completes on. [`crate::usb::NusbTransport`] is the
//! implementation over `nusb`.

use nusb::transfer::TransferError;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::{cdc::ClassRequest, Result};

/// The three endpoints of a CDC-ACM function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    /// Bulk-in, device to host data
    DataIn = 0,
    /// Bulk-out, host to device data
    DataOut = 1,
    /// Interrupt-in, serial state notifications
    Notify = 2,
}

impl Pipe {
    pub const ALL: [Pipe; 3] = [Pipe::DataIn, Pipe::DataOut, Pipe::Notify];
}

/// Identifies one submitted transfer for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

impl TransferId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub enum TransferBuffer {
    /// Read up to this many bytes
    In(usize),
    /// Send these bytes
    Out(Vec<u8>),
}

impl TransferBuffer {
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::In(len) => *len,
            TransferBuffer::Out(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub status: std::result::Result<(), TransferError>,
    /// Received bytes (in transfers only)
    pub data: Vec<u8>,
    /// Bytes actually moved over the bus
    pub actual_length: usize,
}

impl TransferCompletion {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

pub type TransferCallback = Box<dyn FnOnce(TransferCompletion) + Send>;

/// The USB transfer service
pub trait UsbTransport: Send + Sync {
    /// Submit a transfer. On success `on_complete` runs exactly once, later
    /// and never from inside this call. On error it is dropped unused.
    fn submit(
        &self,
        pipe: Pipe,
        buffer: TransferBuffer,
        on_complete: TransferCallback,
    ) -> Result<TransferId>;

    /// Best-effort cancellation. A transfer that already finished is left alone;
    /// otherwise it completes with `TransferError::Cancelled`, possibly before
    /// this call returns. Callers must not hold the device lock.
    fn cancel(&self, id: TransferId);

    /// Cancel every outstanding transfer on `pipe`. Same locking rule as `cancel`.
    fn abort_pipe(&self, pipe: Pipe);

    /// Class-specific control request to the communication interface, host to device
    fn control_out(&self, request: ClassRequest, value: u16, data: &[u8]) -> Result<()>;

    /// Class-specific control request to the communication interface, device to host
    fn control_in(&self, request: ClassRequest, value: u16, length: u16) -> Result<Vec<u8>>;
}

/// Outstanding-transfer counts per pipe, so teardown can wait for a pipe to drain
#[derive(Debug, Default)]
pub(crate) struct PendingTransfers {
    counts: Mutex<[usize; 3]>,
    drained: Condvar,
}

impl PendingTransfers {
    fn counts(&self) -> MutexGuard<'_, [usize; 3]> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn acquire(&self, pipe: Pipe) {
        self.counts()[pipe as usize] += 1;
    }

    pub(crate) fn release(&self, pipe: Pipe) {
        let mut counts = self.counts();
        let count = &mut counts[pipe as usize];
        debug_assert!(*count > 0, "transfer count underflow on {pipe:?}");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn count(&self, pipe: Pipe) -> usize {
        self.counts()[pipe as usize]
    }

    /// Wait for `pipe` to have nothing in flight. `false` on timeout.
    pub(crate) fn wait_drained(&self, pipe: Pipe, timeout: Duration) -> bool {
        let counts = self.counts();
        let (counts, _) = self
            .drained
            .wait_timeout_while(counts, timeout, |counts| counts[pipe as usize] != 0)
            .unwrap_or_else(PoisonError::into_inner);
        counts[pipe as usize] == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn drains_when_released() {
        let pending = Arc::new(PendingTransfers::default());
        pending.acquire(Pipe::DataIn);
        pending.acquire(Pipe::DataIn);
        pending.acquire(Pipe::Notify);

        let releaser = {
            let pending = pending.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                pending.release(Pipe::DataIn);
                pending.release(Pipe::DataIn);
            })
        };

        assert!(pending.wait_drained(Pipe::DataIn, Duration::from_secs(5)));
        releaser.join().unwrap();
        assert_eq!(1, pending.count(Pipe::Notify));
        assert!(pending.wait_drained(Pipe::DataOut, Duration::ZERO));
    }

    #[test]
    fn bounded_wait_times_out() {
        let pending = PendingTransfers::default();
        pending.acquire(Pipe::DataOut);
        assert!(!pending.wait_drained(Pipe::DataOut, Duration::from_millis(5)));
    }
}
