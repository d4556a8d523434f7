//! Interrupt-in notification pump and the wait-on-mask protocol.

use nusb::transfer::TransferError;
use std::sync::Arc;

use crate::{
    events::{parse_serial_state, transition, SerialEvents},
    request::{acquire_cancel_lock, CancelGuard, CancelRoutine, IoRequest, RequestKind, Status},
    transport::{Pipe, TransferBuffer, TransferCompletion},
    Error, Result,
};

use super::{DeviceState, Shared};

/// Bits outside this range are not events
const VALID_EVENTS: u32 = 0x0000_1FFF;

impl Shared {
    // ---------- Wait mask

    pub(super) fn set_wait_mask(self: &Arc<Self>, mask: u32) -> Result<()> {
        if mask & !VALID_EVENTS != 0 {
            return Err(Error::InvalidParameter("wait mask"));
        }
        let cancel = acquire_cancel_lock();
        let mut st = self.state();
        // A new mask answers the pending wait with an empty event set
        if let Some(request) = st.mask_request.take() {
            request.set_cancel_routine(&cancel, None);
            request.set_buffer(0u32.to_le_bytes().to_vec());
            request.complete(Status::Success);
        }
        st.history_mask = SerialEvents::empty();
        st.isr_wait_mask = SerialEvents::from_bits_retain(mask);
        tracing::debug!(device = %self.name, mask = ?st.isr_wait_mask, "wait mask set");
        Ok(())
    }

    pub(super) fn wait_on_mask(self: &Arc<Self>) -> Result<IoRequest> {
        let cancel = acquire_cancel_lock();
        let mut st = self.state();
        if st.isr_wait_mask.is_empty() {
            return Err(Error::InvalidParameter("no events subscribed"));
        }
        if st.mask_request.is_some() {
            return Err(Error::WaitPending);
        }

        let request = IoRequest::new(RequestKind::WaitOnMask, vec![0; 4]);
        if !st.history_mask.is_empty() {
            let events = std::mem::take(&mut st.history_mask);
            request.set_buffer(events.bits().to_le_bytes().to_vec());
            request.complete(Status::Success);
            return Ok(request);
        }

        request.set_cancel_routine(&cancel, Some(self.wait_canceller()));
        st.mask_request = Some(request.clone());
        Ok(request)
    }

    fn wait_canceller(self: &Arc<Self>) -> CancelRoutine {
        let weak = Arc::downgrade(self);
        Box::new(move |_cancel, request| {
            if let Some(shared) = weak.upgrade() {
                let mut st = shared.state();
                match &st.mask_request {
                    Some(pending) if pending.is(request) => st.mask_request = None,
                    _ => return,
                }
            }
            request.set_information(0);
            request.complete(Status::Cancelled);
        })
    }

    /// Hand the accumulated events to the parked wait, if any
    pub(super) fn satisfy_wait(&self, cancel: &CancelGuard, st: &mut DeviceState) {
        if st.history_mask.is_empty() {
            return;
        }
        let Some(request) = st.mask_request.take() else {
            return;
        };
        request.set_cancel_routine(cancel, None);
        let events = std::mem::take(&mut st.history_mask);
        tracing::trace!(device = %self.name, ?events, "wait satisfied");
        request.set_buffer(events.bits().to_le_bytes().to_vec());
        request.complete(Status::Success);
    }

    /// Fail the parked wait, if any
    pub(super) fn cancel_wait(&self, cancel: &CancelGuard, st: &mut DeviceState, status: Status) {
        if let Some(request) = st.mask_request.take() {
            request.set_cancel_routine(cancel, None);
            request.set_information(0);
            request.complete(status);
        }
    }

    // ---------- Interrupt-in pump

    pub(super) fn restart_notify(self: &Arc<Self>) {
        let mut st = self.state();
        if std::mem::take(&mut st.notify_restart_pending) {
            tracing::debug!(device = %self.name, "resuming notification pump");
        }
        if st.notify_active || !st.operational() {
            return;
        }
        self.submit_notify(&mut st);
    }

    fn submit_notify(self: &Arc<Self>, st: &mut DeviceState) {
        st.notify_active = true;
        self.pending.acquire(Pipe::Notify);
        let weak = Arc::downgrade(self);
        let submitted = self.transport.submit(
            Pipe::Notify,
            TransferBuffer::In(self.config.notify_transfer_size),
            Box::new(move |completion: TransferCompletion| {
                if let Some(shared) = weak.upgrade() {
                    shared.notify_complete(completion);
                }
            }),
        );
        if let Err(err) = submitted {
            self.pending.release(Pipe::Notify);
            st.notify_active = false;
            tracing::warn!(device = %self.name, "cannot submit interrupt-in transfer: {err}");
        }
    }

    fn notify_complete(self: &Arc<Self>, completion: TransferCompletion) {
        let defer = {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            match &completion.status {
                Ok(()) => {
                    let len = completion.actual_length.min(completion.data.len());
                    self.serial_state_changed(&cancel, &mut st, &completion.data[..len]);
                    if st.operational() {
                        self.submit_notify(&mut st);
                        false
                    } else {
                        true
                    }
                }
                Err(err) => {
                    if st.running {
                        tracing::warn!(device = %self.name, ?err, "notification pump stopped");
                    }
                    st.running = false;
                    st.notify_active = false;
                    let status = match err {
                        TransferError::Disconnected => Status::DeviceRemoved,
                        _ => Status::Unsuccessful,
                    };
                    self.kill_all_reads(&cancel, &mut st, status);
                    self.cancel_wait(&cancel, &mut st, status);
                    false
                }
            }
        };
        self.pending.release(Pipe::Notify);

        if defer {
            self.defer(|shared| {
                let mut st = shared.state();
                if st.operational() {
                    shared.submit_notify(&mut st);
                } else {
                    // Picked up again by start or the next transition into D0
                    tracing::debug!(device = %shared.name, "notification pump parked");
                    st.notify_active = false;
                    st.notify_restart_pending = true;
                }
            });
        }
    }

    fn serial_state_changed(&self, cancel: &CancelGuard, st: &mut DeviceState, packet: &[u8]) {
        let Some(state) = parse_serial_state(packet) else {
            tracing::trace!(device = %self.name, len = packet.len(), "ignoring notification");
            return;
        };
        let previous = std::mem::replace(&mut st.serial_state, state);
        let change = transition(previous, state, &mut st.stats);
        st.modem_status = state.modem_status();
        st.errors |= change.errors;
        tracing::debug!(device = %self.name, ?previous, ?state, events = ?change.events, "serial state");

        st.history_mask |= change.events & st.isr_wait_mask;
        self.satisfy_wait(cancel, st);
    }
}
