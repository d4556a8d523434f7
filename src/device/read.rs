//! Receive path: the bulk-in pump filling the receive store, and the FIFO of
//! caller reads draining it.

use nusb::transfer::TransferError;
use std::{sync::Arc, time::Duration};

use crate::{
    events::{rx_events, SerialErrors, SerialEvents},
    request::{
        acquire_cancel_lock, CancelGuard, CancelRoutine, IoRequest, RequestKind, RequestRefs,
        Status,
    },
    timer::TimerId,
    transport::{Pipe, TransferBuffer, TransferCompletion},
};

use super::{DeviceState, PowerState, ReadingState, Shared};

/// The read draining the receive store
pub(crate) struct CurrentRead {
    request: IoRequest,
    /// Status chosen by the first completion source to fire
    completing: Option<Status>,
    interval: Option<Duration>,
    interval_timer: Option<TimerId>,
    total_timer: Option<TimerId>,
    last_byte_at: Duration,
}

#[derive(Debug, Clone, Copy)]
enum ReadTimer {
    Interval,
    Total,
}

impl ReadTimer {
    fn reference(self) -> RequestRefs {
        match self {
            ReadTimer::Interval => RequestRefs::IntervalTimerPending,
            ReadTimer::Total => RequestRefs::TotalTimerPending,
        }
    }
}

fn failure_status(err: Option<TransferError>) -> Status {
    match err {
        Some(TransferError::Disconnected) => Status::DeviceRemoved,
        _ => Status::Unsuccessful,
    }
}

impl Shared {
    pub(super) fn read(self: &Arc<Self>, length: usize) -> IoRequest {
        if length == 0 {
            return IoRequest::finished(RequestKind::Read, Status::Success);
        }

        let request = IoRequest::new(RequestKind::Read, vec![0; length]);
        let cancel = acquire_cancel_lock();
        let mut st = self.state();
        if !st.operational() {
            tracing::debug!(device = %self.name, "read on a device that is not running");
            request.complete(Status::Unsuccessful);
            return request;
        }

        if st.current_read.is_none() && st.read_queue.is_empty() {
            self.start_next_read(&cancel, &mut st, Some(request.clone()));
        } else if request.is_cancelled() {
            request.complete(Status::Cancelled);
        } else {
            request.set_cancel_routine(&cancel, Some(self.queued_read_canceller()));
            st.read_queue.push_back(request.clone());
        }
        self.kick_read_pump(&mut st);
        request
    }

    fn queued_read_canceller(self: &Arc<Self>) -> CancelRoutine {
        let weak = Arc::downgrade(self);
        Box::new(move |_cancel, request| {
            if let Some(shared) = weak.upgrade() {
                let mut st = shared.state();
                let Some(pos) = st.read_queue.iter().position(|r| r.is(request)) else {
                    return;
                };
                st.read_queue.remove(pos);
            }
            request.complete(Status::Cancelled);
        })
    }

    fn current_read_canceller(self: &Arc<Self>) -> CancelRoutine {
        let weak = Arc::downgrade(self);
        Box::new(move |cancel, request| {
            let Some(shared) = weak.upgrade() else {
                request.complete(Status::Cancelled);
                return;
            };
            let mut st = shared.state();
            let is_current = st
                .current_read
                .as_ref()
                .is_some_and(|current| current.request.is(request));
            if !is_current {
                return;
            }
            shared.try_complete_current_read(
                &cancel,
                &mut st,
                Status::Cancelled,
                RequestRefs::CancelPending,
            );
            shared.kick_read_pump(&mut st);
        })
    }

    /// Promote `next` (and, as they finish, its successors) to the current read.
    fn start_next_read(
        self: &Arc<Self>,
        cancel: &CancelGuard,
        st: &mut DeviceState,
        mut next: Option<IoRequest>,
    ) {
        while let Some(request) = next.take() {
            // Queued reads carry the queue's cancel routine
            request.set_cancel_routine(cancel, None);
            if request.is_cancelled() {
                request.complete(Status::Cancelled);
                next = st.read_queue.pop_front();
                continue;
            }

            let policy = st.timeouts.read_policy(request.length());
            if policy.crunch_to_one {
                request.truncate(1);
            }
            request.fill(|buf| st.rx.get(buf));
            if request.remaining() == 0 || policy.return_immediately {
                request.complete(Status::Success);
                next = st.read_queue.pop_front();
                continue;
            }

            let mut current = CurrentRead {
                request: request.clone(),
                completing: None,
                interval: policy.interval,
                interval_timer: None,
                total_timer: None,
                last_byte_at: self.timers.now(),
            };
            request.add_refs(RequestRefs::CancelPending);
            request.set_cancel_routine(cancel, Some(self.current_read_canceller()));
            if let Some(total) = policy.total {
                request.add_refs(RequestRefs::TotalTimerPending);
                current.total_timer = Some(self.arm_read_timer(&request, ReadTimer::Total, total));
            }
            if request.information() > 0 {
                self.arm_interval(&mut current);
            }
            tracing::trace!(device = %self.name, id = request.id(), ?policy, "read parked");
            st.current_read = Some(current);
        }
    }

    fn arm_read_timer(
        self: &Arc<Self>,
        request: &IoRequest,
        which: ReadTimer,
        after: Duration,
    ) -> TimerId {
        let weak = Arc::downgrade(self);
        let id = request.id();
        self.timers.schedule(
            after,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.read_timer_fired(id, which);
                }
            }),
        )
    }

    /// The inter-character timer only runs once the first byte is in
    fn arm_interval(self: &Arc<Self>, current: &mut CurrentRead) {
        let Some(interval) = current.interval else {
            return;
        };
        if current
            .request
            .refs()
            .contains(RequestRefs::IntervalTimerPending)
        {
            return;
        }
        current.request.add_refs(RequestRefs::IntervalTimerPending);
        current.interval_timer =
            Some(self.arm_read_timer(&current.request, ReadTimer::Interval, interval));
    }

    fn read_timer_fired(self: &Arc<Self>, id: u64, which: ReadTimer) {
        let cancel = acquire_cancel_lock();
        let mut st = self.state();
        let now = self.timers.now();
        let Some(current) = st
            .current_read
            .as_mut()
            .filter(|current| current.request.id() == id)
        else {
            tracing::trace!(device = %self.name, id, ?which, "stale read timer");
            return;
        };

        match which {
            ReadTimer::Total => current.total_timer = None,
            ReadTimer::Interval => {
                current.interval_timer = None;
                let interval = current.interval.unwrap_or_default();
                let idle = now.saturating_sub(current.last_byte_at);
                if current.completing.is_none() && idle < interval {
                    // Bytes kept coming, check again when the gap could have elapsed
                    current.interval_timer = Some(self.arm_read_timer(
                        &current.request,
                        ReadTimer::Interval,
                        interval - idle,
                    ));
                    return;
                }
            }
        }

        tracing::debug!(device = %self.name, id, ?which, "read timed out");
        self.try_complete_current_read(&cancel, &mut st, Status::Timeout, which.reference());
        self.kick_read_pump(&mut st);
    }

    /// Record `status` as the current read's outcome unless another source got
    /// there first, retire `retiring` and disarm whatever else may still fire.
    /// The read completes once nothing references it; the next one starts then.
    pub(super) fn try_complete_current_read(
        self: &Arc<Self>,
        cancel: &CancelGuard,
        st: &mut DeviceState,
        status: Status,
        retiring: RequestRefs,
    ) {
        let Some(current) = st.current_read.as_mut() else {
            return;
        };
        let request = current.request.clone();
        let status = *current.completing.get_or_insert(status);
        request.retire(retiring);

        let held = request.refs();
        if held.contains(RequestRefs::CancelPending)
            && request.set_cancel_routine(cancel, None).is_some()
        {
            request.retire(RequestRefs::CancelPending);
        }
        if held.contains(RequestRefs::TotalTimerPending) {
            if let Some(timer) = current.total_timer.take() {
                if self.timers.cancel(timer) {
                    request.retire(RequestRefs::TotalTimerPending);
                }
            }
        }
        if held.contains(RequestRefs::IntervalTimerPending) {
            if let Some(timer) = current.interval_timer.take() {
                if self.timers.cancel(timer) {
                    request.retire(RequestRefs::IntervalTimerPending);
                }
            }
        }

        let refs = request.refs();
        if !refs.is_empty() {
            tracing::trace!(device = %self.name, id = request.id(), ?refs, "read completion deferred");
            return;
        }

        st.current_read = None;
        request.complete(status);
        let next = st.read_queue.pop_front();
        self.start_next_read(cancel, st, next);
    }

    /// Move freshly stored bytes into the current read
    fn service_current_read(self: &Arc<Self>, cancel: &CancelGuard, st: &mut DeviceState) {
        let DeviceState {
            current_read, rx, ..
        } = &mut *st;
        let Some(current) = current_read.as_mut() else {
            return;
        };
        if current.completing.is_some() {
            return;
        }
        if current.request.fill(|buf| rx.get(buf)) == 0 {
            return;
        }
        current.last_byte_at = self.timers.now();

        if current.request.remaining() == 0 {
            self.try_complete_current_read(cancel, st, Status::Success, RequestRefs::empty());
        } else {
            self.arm_interval(current);
        }
    }

    /// Complete the current read and everything queued behind it
    pub(super) fn kill_all_reads(
        self: &Arc<Self>,
        cancel: &CancelGuard,
        st: &mut DeviceState,
        status: Status,
    ) {
        let queued = std::mem::take(&mut st.read_queue);
        self.try_complete_current_read(cancel, st, status, RequestRefs::empty());
        for request in queued {
            request.set_cancel_routine(cancel, None);
            request.complete(status);
        }
    }

    // ---------- Bulk-in pump

    fn can_pump(&self, st: &DeviceState) -> bool {
        st.reading_on && st.operational() && st.rx.len() <= self.config.rx_high_water
    }

    /// Start a bulk-in transfer if none is outstanding and the store has room
    pub(super) fn kick_read_pump(self: &Arc<Self>, st: &mut DeviceState) {
        if !self.can_pump(st) {
            return;
        }
        match st.reading {
            ReadingState::Idle => self.submit_read(st),
            ReadingState::Started | ReadingState::Completing => {
                st.reading = ReadingState::Restart
            }
            ReadingState::Restart => {}
        }
    }

    pub(super) fn restart_read(self: &Arc<Self>) {
        let mut st = self.state();
        self.kick_read_pump(&mut st);
    }

    /// Submitting under the device lock orders this against teardown
    fn submit_read(self: &Arc<Self>, st: &mut DeviceState) {
        st.reading = ReadingState::Started;
        self.pending.acquire(Pipe::DataIn);
        let weak = Arc::downgrade(self);
        let submitted = self.transport.submit(
            Pipe::DataIn,
            TransferBuffer::In(self.config.in_transfer_size),
            Box::new(move |completion: TransferCompletion| {
                if let Some(shared) = weak.upgrade() {
                    shared.read_complete(completion);
                }
            }),
        );
        if let Err(err) = submitted {
            self.pending.release(Pipe::DataIn);
            st.reading = ReadingState::Idle;
            tracing::warn!(device = %self.name, "cannot submit bulk-in transfer: {err}");
        }
    }

    fn read_complete(self: &Arc<Self>, completion: TransferCompletion) {
        let resubmit = {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            st.reading = ReadingState::Completing;

            if completion.is_ok() && st.power == PowerState::D0 {
                let len = completion.actual_length.min(completion.data.len());
                self.receive(&cancel, &mut st, &completion.data[..len]);
                if self.can_pump(&st) {
                    // Still owned by the pump until the deferred submission runs
                    st.reading = ReadingState::Started;
                    true
                } else {
                    st.reading = ReadingState::Idle;
                    false
                }
            } else {
                let err = completion.status.err();
                if st.running {
                    tracing::warn!(
                        device = %self.name,
                        ?err,
                        power = ?st.power,
                        "bulk-in pump stopped"
                    );
                }
                st.reading = ReadingState::Idle;
                st.running = false;
                let status = failure_status(err);
                self.kill_all_reads(&cancel, &mut st, status);
                self.cancel_wait(&cancel, &mut st, status);
                false
            }
        };
        self.pending.release(Pipe::DataIn);

        if resubmit {
            self.defer(|shared| {
                let mut st = shared.state();
                if shared.can_pump(&st) {
                    shared.submit_read(&mut st);
                } else {
                    st.reading = ReadingState::Idle;
                }
            });
        }
    }

    /// Store received bytes, raise receive events and feed the current read
    fn receive(self: &Arc<Self>, cancel: &CancelGuard, st: &mut DeviceState, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let stored = st.rx.put(data);
        st.stats.received_count = st.stats.received_count.wrapping_add(stored as u32);

        let mut events = rx_events(
            data,
            st.chars.event_char,
            st.isr_wait_mask,
            st.rx.len(),
            st.rx.capacity(),
        );
        if stored < data.len() {
            tracing::warn!(
                device = %self.name,
                dropped = data.len() - stored,
                "receive store full, dropping bytes"
            );
            st.stats.buffer_overrun_error_count =
                st.stats.buffer_overrun_error_count.wrapping_add(1);
            st.errors |= SerialErrors::QueueOverrun;
            events |= SerialEvents::Err;
        }

        st.history_mask |= events & st.isr_wait_mask;
        self.satisfy_wait(cancel, st);
        self.service_current_read(cancel, st);
    }
}
