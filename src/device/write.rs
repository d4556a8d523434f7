//! Transmit path: one bulk-out transfer per caller write, with an optional
//! total timeout that cancels the transfer.

use nusb::transfer::TransferError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use crate::{
    events::SerialEvents,
    request::{acquire_cancel_lock, CancelRoutine, IoRequest, RequestKind, Status},
    timer::TimerId,
    transport::{Pipe, TransferBuffer, TransferCompletion, TransferId, UsbTransport},
};

use super::Shared;

#[derive(Default)]
struct TransferSlot {
    id: Option<TransferId>,
    cancel_requested: bool,
}

/// Everything a write's completion, timer and cancel routine share
struct WriteContext {
    request: IoRequest,
    length: usize,
    timed_out: AtomicBool,
    transfer: Mutex<TransferSlot>,
    timer: Mutex<Option<TimerId>>,
}

impl WriteContext {
    fn transfer(&self) -> MutexGuard<'_, TransferSlot> {
        self.transfer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<TimerId>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the transfer now, or as soon as its id is known
    fn cancel_transfer(&self, transport: &dyn UsbTransport) {
        let id = {
            let mut slot = self.transfer();
            slot.cancel_requested = true;
            slot.id
        };
        if let Some(id) = id {
            transport.cancel(id);
        }
    }

    fn submitted(&self, id: TransferId, transport: &dyn UsbTransport) {
        let cancel = {
            let mut slot = self.transfer();
            slot.id = Some(id);
            slot.cancel_requested
        };
        if cancel {
            transport.cancel(id);
        }
    }
}

impl Shared {
    pub(super) fn write(self: &Arc<Self>, data: Vec<u8>) -> IoRequest {
        if data.is_empty() {
            return IoRequest::finished(RequestKind::Write, Status::Success);
        }

        let length = data.len();
        let request = IoRequest::new(RequestKind::Write, data);
        let payload = request.take_buffer();
        let ctx = Arc::new(WriteContext {
            request: request.clone(),
            length,
            timed_out: AtomicBool::new(false),
            transfer: Mutex::new(TransferSlot::default()),
            timer: Mutex::new(None),
        });

        let cancel = acquire_cancel_lock();
        let mut st = self.state();
        if !st.operational() {
            tracing::debug!(device = %self.name, "write on a device that is not running");
            request.complete(Status::Unsuccessful);
            return request;
        }

        let timeout = st.timeouts.write_timeout(length);
        request.set_cancel_routine(&cancel, Some(self.write_canceller(&ctx)));
        st.pending_writes += 1;
        st.out_queue_bytes += length;
        self.pending.acquire(Pipe::DataOut);

        let weak = Arc::downgrade(self);
        let on_complete = {
            let ctx = ctx.clone();
            Box::new(move |completion: TransferCompletion| match weak.upgrade() {
                Some(shared) => shared.write_complete(&ctx, completion),
                None => {
                    ctx.request.set_information(completion.actual_length);
                    ctx.request.complete(Status::Cancelled);
                }
            })
        };
        match self
            .transport
            .submit(Pipe::DataOut, TransferBuffer::Out(payload), on_complete)
        {
            Ok(id) => {
                if let Some(timeout) = timeout {
                    *ctx.timer() = Some(self.arm_write_timer(&ctx, timeout));
                }
                drop(st);
                drop(cancel);
                ctx.submitted(id, &*self.transport);
            }
            Err(err) => {
                tracing::warn!(device = %self.name, "cannot submit bulk-out transfer: {err}");
                self.pending.release(Pipe::DataOut);
                st.pending_writes -= 1;
                st.out_queue_bytes -= length;
                request.set_cancel_routine(&cancel, None);
                drop(st);
                drop(cancel);
                request.complete(Status::InsufficientResources);
            }
        }
        request
    }

    fn write_canceller(self: &Arc<Self>, ctx: &Arc<WriteContext>) -> CancelRoutine {
        let weak = Arc::downgrade(self);
        let ctx = ctx.clone();
        Box::new(move |cancel, _request| {
            // The transfer's completion may run inside `cancel`
            drop(cancel);
            if let Some(shared) = weak.upgrade() {
                ctx.cancel_transfer(&*shared.transport);
            }
        })
    }

    fn arm_write_timer(
        self: &Arc<Self>,
        ctx: &Arc<WriteContext>,
        after: std::time::Duration,
    ) -> TimerId {
        let weak = Arc::downgrade(self);
        let ctx = ctx.clone();
        self.timers.schedule(
            after,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                tracing::debug!(device = %shared.name, id = ctx.request.id(), "write timed out");
                ctx.timed_out.store(true, Ordering::SeqCst);
                ctx.cancel_transfer(&*shared.transport);
            }),
        )
    }

    fn write_complete(self: &Arc<Self>, ctx: &WriteContext, completion: TransferCompletion) {
        let timer = {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            ctx.request.set_cancel_routine(&cancel, None);
            st.pending_writes = st.pending_writes.saturating_sub(1);
            st.out_queue_bytes = st.out_queue_bytes.saturating_sub(ctx.length);
            st.stats.transmitted_count = st
                .stats
                .transmitted_count
                .wrapping_add(completion.actual_length as u32);
            if st.pending_writes == 0 {
                let mask = st.isr_wait_mask;
                st.history_mask |= SerialEvents::TxEmpty & mask;
                self.satisfy_wait(&cancel, &mut st);
            }
            ctx.timer().take()
        };
        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }

        let status = match completion.status {
            Ok(()) => Status::Success,
            Err(TransferError::Cancelled) if ctx.timed_out.load(Ordering::SeqCst) => {
                Status::Timeout
            }
            Err(TransferError::Cancelled) => Status::Cancelled,
            Err(TransferError::Disconnected) => Status::DeviceRemoved,
            Err(err) => {
                tracing::warn!(device = %self.name, ?err, "bulk-out transfer failed");
                Status::Unsuccessful
            }
        };
        ctx.request.set_information(completion.actual_length);
        ctx.request.complete(status);
        self.pending.release(Pipe::DataOut);
    }
}

#[cfg(test)]
mod test {
    use crate::{
        events::SerialEvents, mock::Harness, request::Status, timeouts::SerialTimeouts,
        transport::Pipe,
    };
    use nusb::transfer::TransferError;

    #[test]
    fn zero_length_write() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        let c = port.write(Vec::new()).completion().unwrap();
        assert_eq!(Status::Success, c.status);
        assert_eq!(0, h.transport.outstanding(Pipe::DataOut));
    }

    #[test]
    fn write_completes_and_raises_tx_empty() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        port.set_wait_mask(SerialEvents::TxEmpty).unwrap();
        let wait = port.wait_on_mask().unwrap();

        let w1 = port.write(b"AT\r".to_vec());
        let w2 = port.write(b"ATZ\r".to_vec());
        assert_eq!(vec![b"AT\r".to_vec(), b"ATZ\r".to_vec()], h.transport.out_payloads());
        assert_eq!(7, port.get_comm_status().unwrap().amount_in_out_queue);

        h.transport.complete_ok(Pipe::DataOut, &[]);
        assert_eq!(3, w1.completion().unwrap().information);
        assert!(!wait.is_complete());

        h.transport.complete_ok(Pipe::DataOut, &[]);
        assert_eq!(Status::Success, w2.completion().unwrap().status);
        assert_eq!(Some(SerialEvents::TxEmpty), wait.completion().unwrap().events());
        assert_eq!(7, port.get_stats().unwrap().transmitted_count);
        assert_eq!(0, port.get_comm_status().unwrap().amount_in_out_queue);
    }

    #[test]
    fn write_timeout() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        port.set_timeouts(SerialTimeouts {
            write_total_timeout_multiplier: 1,
            write_total_timeout_constant: 100,
            ..Default::default()
        })
        .unwrap();
        let w = port.write(vec![0x55; 10]);
        h.advance(109);
        assert!(!w.is_complete());
        h.advance(1);
        let c = w.completion().unwrap();
        assert_eq!(Status::Timeout, c.status);
        assert_eq!(0, h.transport.outstanding(Pipe::DataOut));
        assert_eq!(0, h.device.pending_transfers(Pipe::DataOut));
    }

    #[test]
    fn completed_write_disarms_timer() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        port.set_timeouts(SerialTimeouts {
            write_total_timeout_constant: 100,
            ..Default::default()
        })
        .unwrap();
        let w = port.write(b"x".to_vec());
        assert_eq!(1, h.timers.armed());
        h.transport.complete_ok(Pipe::DataOut, &[]);
        assert_eq!(Status::Success, w.completion().unwrap().status);
        assert_eq!(0, h.timers.armed());
    }

    #[test]
    fn cancelled_write() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        let w = port.write(b"hello".to_vec());
        assert!(w.cancel());
        let c = w.completion().unwrap();
        assert_eq!(Status::Cancelled, c.status);
        assert_eq!(0, h.device.pending_transfers(Pipe::DataOut));
    }

    #[test]
    fn failed_transfer() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        let w = port.write(b"hello".to_vec());
        h.transport.fail(Pipe::DataOut, TransferError::Stall);
        assert_eq!(Status::Unsuccessful, w.completion().unwrap().status);
    }

    #[test]
    fn submit_failure() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        h.transport.fail_next_submit(Pipe::DataOut);
        let w = port.write(b"hello".to_vec());
        assert_eq!(
            Status::InsufficientResources,
            w.completion().unwrap().status
        );
        assert_eq!(0, port.get_comm_status().unwrap().amount_in_out_queue);
    }

    #[test]
    fn write_on_stopped_device() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        h.device.remove().unwrap();
        let w = port.write(b"hello".to_vec());
        assert_eq!(Status::Unsuccessful, w.completion().unwrap().status);
    }
}
