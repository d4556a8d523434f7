//! Scripted collaborators for driving a device deterministically in tests.

use nusb::transfer::TransferError;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    cdc::ClassRequest,
    device::{Config, Device, Services},
    events::{serial_state_packet, SerialState},
    slots::DeviceSlots,
    timer::{TimerCallback, TimerId, TimerService},
    transport::{
        Pipe, TransferBuffer, TransferCallback, TransferCompletion, TransferId, UsbTransport,
    },
    work::{WorkItem, WorkQueue},
    Error, Result,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------- Transport

struct Submitted {
    id: TransferId,
    pipe: Pipe,
    buffer: TransferBuffer,
    on_complete: TransferCallback,
}

#[derive(Default)]
struct MockInner {
    outstanding: Vec<Submitted>,
    control_log: Vec<(ClassRequest, u16, Vec<u8>)>,
    line_coding_reply: Option<Vec<u8>>,
    fail_next_submit: Option<Pipe>,
    stall_control_out: bool,
    ignore_abort: bool,
}

/// Holds submitted transfers until a test completes them. Cancellation
/// completes synchronously, inside `cancel`/`abort_pipe`.
#[derive(Default)]
pub(crate) struct MockTransport {
    inner: Mutex<MockInner>,
}

impl MockTransport {
    pub(crate) fn outstanding(&self, pipe: Pipe) -> usize {
        lock(&self.inner)
            .outstanding
            .iter()
            .filter(|t| t.pipe == pipe)
            .count()
    }

    /// Payloads of the outstanding bulk-out transfers, oldest first
    pub(crate) fn out_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.inner)
            .outstanding
            .iter()
            .filter_map(|t| match &t.buffer {
                TransferBuffer::Out(data) => Some(data.clone()),
                TransferBuffer::In(_) => None,
            })
            .collect()
    }

    fn take_oldest(&self, pipe: Pipe) -> Option<Submitted> {
        let mut inner = lock(&self.inner);
        let pos = inner.outstanding.iter().position(|t| t.pipe == pipe)?;
        Some(inner.outstanding.remove(pos))
    }

    /// Complete the oldest transfer on `pipe`. IN transfers receive `data`,
    /// OUT transfers report their whole payload as sent.
    pub(crate) fn complete_ok(&self, pipe: Pipe, data: &[u8]) -> bool {
        let Some(transfer) = self.take_oldest(pipe) else {
            return false;
        };
        let completion = match transfer.buffer {
            TransferBuffer::In(len) => {
                let data = data[..data.len().min(len)].to_vec();
                TransferCompletion {
                    status: Ok(()),
                    actual_length: data.len(),
                    data,
                }
            }
            TransferBuffer::Out(payload) => TransferCompletion {
                status: Ok(()),
                data: Vec::new(),
                actual_length: payload.len(),
            },
        };
        (transfer.on_complete)(completion);
        true
    }

    pub(crate) fn fail(&self, pipe: Pipe, err: TransferError) -> bool {
        let Some(transfer) = self.take_oldest(pipe) else {
            return false;
        };
        (transfer.on_complete)(TransferCompletion {
            status: Err(err),
            data: Vec::new(),
            actual_length: 0,
        });
        true
    }

    pub(crate) fn fail_next_submit(&self, pipe: Pipe) {
        lock(&self.inner).fail_next_submit = Some(pipe);
    }

    /// Make every class OUT request stall
    pub(crate) fn stall_control_out(&self, stall: bool) {
        lock(&self.inner).stall_control_out = stall;
    }

    /// Make `abort_pipe` a no-op, leaving transfers stuck
    pub(crate) fn ignore_abort(&self, ignore: bool) {
        lock(&self.inner).ignore_abort = ignore;
    }

    pub(crate) fn control_log(&self) -> Vec<(ClassRequest, u16, Vec<u8>)> {
        lock(&self.inner).control_log.clone()
    }

    /// `None` makes GET_LINE_CODING stall
    pub(crate) fn set_line_coding_reply(&self, reply: Option<Vec<u8>>) {
        lock(&self.inner).line_coding_reply = reply;
    }

    fn cancel_where(&self, selected: impl Fn(&Submitted) -> bool) {
        let cancelled: Vec<Submitted> = {
            let mut inner = lock(&self.inner);
            let (hit, keep) = std::mem::take(&mut inner.outstanding)
                .into_iter()
                .partition(|t| selected(t));
            inner.outstanding = keep;
            hit
        };
        for transfer in cancelled {
            (transfer.on_complete)(TransferCompletion {
                status: Err(TransferError::Cancelled),
                data: Vec::new(),
                actual_length: 0,
            });
        }
    }
}

impl UsbTransport for MockTransport {
    fn submit(
        &self,
        pipe: Pipe,
        buffer: TransferBuffer,
        on_complete: TransferCallback,
    ) -> Result<TransferId> {
        let mut inner = lock(&self.inner);
        if inner.fail_next_submit == Some(pipe) {
            inner.fail_next_submit = None;
            return Err(Error::Transfer(TransferError::Fault));
        }
        let id = TransferId::next();
        inner.outstanding.push(Submitted {
            id,
            pipe,
            buffer,
            on_complete,
        });
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        self.cancel_where(|t| t.id == id);
    }

    fn abort_pipe(&self, pipe: Pipe) {
        if lock(&self.inner).ignore_abort {
            return;
        }
        self.cancel_where(|t| t.pipe == pipe);
    }

    fn control_out(&self, request: ClassRequest, value: u16, data: &[u8]) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.stall_control_out {
            return Err(Error::Transfer(TransferError::Stall));
        }
        inner.control_log.push((request, value, data.to_vec()));
        Ok(())
    }

    fn control_in(&self, request: ClassRequest, value: u16, length: u16) -> Result<Vec<u8>> {
        let mut inner = lock(&self.inner);
        inner.control_log.push((request, value, Vec::new()));
        match &inner.line_coding_reply {
            Some(reply) if request == ClassRequest::GetLineCoding => {
                Ok(reply[..reply.len().min(usize::from(length))].to_vec())
            }
            _ => Err(Error::Transfer(TransferError::Stall)),
        }
    }
}

// ---------- Timer

#[derive(Default)]
struct TimerInner {
    now: Duration,
    armed: BTreeMap<(Duration, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Duration>,
    refuse_cancel: bool,
}

/// Virtual clock. Timers only fire from [`ManualTimer::advance`] and
/// [`ManualTimer::fire_at`].
#[derive(Default)]
pub(crate) struct ManualTimer {
    inner: Mutex<TimerInner>,
}

impl ManualTimer {
    /// Move the clock forward, firing due timers in deadline order
    pub(crate) fn advance(&self, by: Duration) {
        let target = lock(&self.inner).now + by;
        loop {
            let callback = {
                let mut inner = lock(&self.inner);
                let due = inner
                    .armed
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                let Some(key) = due else {
                    inner.now = target;
                    break;
                };
                inner.now = inner.now.max(key.0);
                inner.deadlines.remove(&key.1);
                inner.armed.remove(&key)
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Fire just the timers due at `deadline`, moving the clock there if it is
    /// behind. Lets a later timer expire before an earlier one.
    pub(crate) fn fire_at(&self, deadline: Duration) {
        let callbacks: Vec<TimerCallback> = {
            let mut inner = lock(&self.inner);
            inner.now = inner.now.max(deadline);
            let due: Vec<(Duration, TimerId)> = inner
                .armed
                .keys()
                .filter(|(at, _)| *at == deadline)
                .copied()
                .collect();
            due.into_iter()
                .filter_map(|key| {
                    inner.deadlines.remove(&key.1);
                    inner.armed.remove(&key)
                })
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn armed(&self) -> usize {
        lock(&self.inner).armed.len()
    }

    /// Simulate timers that are already firing: `cancel` fails but the
    /// callback still runs on the next `advance`.
    pub(crate) fn refuse_cancel(&self, refuse: bool) {
        lock(&self.inner).refuse_cancel = refuse;
    }
}

impl TimerService for ManualTimer {
    fn now(&self) -> Duration {
        lock(&self.inner).now
    }

    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId::next();
        let mut inner = lock(&self.inner);
        let deadline = inner.now + after;
        inner.armed.insert((deadline, id), callback);
        inner.deadlines.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut inner = lock(&self.inner);
        if inner.refuse_cancel {
            return false;
        }
        match inner.deadlines.remove(&id) {
            Some(deadline) => inner.armed.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }
}

// ---------- Work queue

#[derive(Default)]
pub(crate) struct ManualWorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl ManualWorkQueue {
    /// Run queued items, including ones queued while running, until none are left
    pub(crate) fn run_pending(&self) {
        loop {
            let item = lock(&self.items).pop_front();
            match item {
                Some(item) => item(),
                None => break,
            }
        }
    }
}

impl WorkQueue for ManualWorkQueue {
    fn queue(&self, item: WorkItem) {
        lock(&self.items).push_back(item);
    }
}

// ---------- Harness

/// A device wired to the mocks above
pub(crate) struct Harness {
    pub device: Device,
    pub transport: Arc<MockTransport>,
    pub timers: Arc<ManualTimer>,
    pub work: Arc<ManualWorkQueue>,
    pub slots: Arc<DeviceSlots>,
}

impl Harness {
    /// Started device with the default configuration
    pub(crate) fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub(crate) fn with_config(config: Config) -> Self {
        let h = Self::unstarted(config);
        h.device.start().unwrap();
        h.settle();
        h
    }

    pub(crate) fn unstarted(config: Config) -> Self {
        let transport = Arc::new(MockTransport::default());
        let timers = Arc::new(ManualTimer::default());
        let work = Arc::new(ManualWorkQueue::default());
        let slots = Arc::new(DeviceSlots::default());
        let services = Services {
            transport: transport.clone(),
            timers: timers.clone(),
            work: work.clone(),
            slots: slots.clone(),
        };
        Self {
            device: Device::new(services, config).unwrap(),
            transport,
            timers,
            work,
            slots,
        }
    }

    pub(crate) fn services_with_slots(&self, slots: Arc<DeviceSlots>) -> Services {
        Services {
            transport: self.transport.clone(),
            timers: self.timers.clone(),
            work: self.work.clone(),
            slots,
        }
    }

    pub(crate) fn settle(&self) {
        self.work.run_pending();
    }

    /// Deliver `data` on the outstanding bulk-in transfer
    pub(crate) fn rx(&self, data: &[u8]) {
        assert!(
            self.transport.complete_ok(Pipe::DataIn, data),
            "no bulk-in transfer outstanding"
        );
        self.settle();
    }

    /// Deliver a SERIAL_STATE notification on the outstanding interrupt-in transfer
    pub(crate) fn notify(&self, state: SerialState) {
        assert!(
            self.transport
                .complete_ok(Pipe::Notify, &serial_state_packet(state, 0)),
            "no interrupt-in transfer outstanding"
        );
        self.settle();
    }

    pub(crate) fn advance(&self, ms: u64) {
        self.timers.advance(Duration::from_millis(ms));
        self.settle();
    }
}

mod test {
    use super::*;
    use crate::{
        events::SerialEvents, request::Status, timeouts::SerialTimeouts, IoRequest,
    };

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Source {
        Data,
        Cancel,
        Interval,
        Total,
    }

    const INTERVAL_MS: u64 = 10;
    const TOTAL_MS: u64 = 100;

    fn apply(h: &Harness, req: &IoRequest, start: Duration, source: Source) {
        match source {
            Source::Data => h.rx(b"cd"),
            Source::Cancel => {
                req.cancel();
            }
            Source::Interval => h.timers.fire_at(start + Duration::from_millis(INTERVAL_MS)),
            Source::Total => h.timers.fire_at(start + Duration::from_millis(TOTAL_MS)),
        }
        h.settle();
    }

    fn orders(sources: &[Source]) -> Vec<Vec<Source>> {
        if sources.is_empty() {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for (i, first) in sources.iter().enumerate() {
            let mut rest = sources.to_vec();
            rest.remove(i);
            for mut tail in orders(&rest) {
                tail.insert(0, *first);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn first_source_decides_under_every_order() {
        use Source::*;
        let all = orders(&[Data, Cancel, Interval, Total]);
        assert_eq!(24, all.len());

        for order in all {
            let h = Harness::new();
            let port = h.device.open().unwrap();
            port.set_timeouts(SerialTimeouts {
                read_interval_timeout: INTERVAL_MS as u32,
                read_total_timeout_constant: TOTAL_MS as u32,
                ..Default::default()
            })
            .unwrap();
            // Two bytes already in, so the interval timer runs from the start
            h.rx(b"ab");
            let start = h.timers.now();
            let req = port.read(4);
            let next = port.read(1);
            assert_eq!(2, h.timers.armed(), "order {order:?}");

            // Nothing can be disarmed, so every source really fires
            h.timers.refuse_cancel(true);
            for &source in &order {
                apply(&h, &req, start, source);
            }
            h.timers.refuse_cancel(false);
            h.advance(1000);

            let c = req.completion().unwrap();
            let expected = match order[0] {
                Data => Status::Success,
                Cancel => Status::Cancelled,
                Interval | Total => Status::Timeout,
            };
            assert_eq!(expected, c.status, "order {order:?}");
            let information = if order[0] == Data { 4 } else { 2 };
            assert_eq!(information, c.information, "order {order:?}");
            // The queued read only ran once the first one was fully released
            assert!(next.is_complete(), "order {order:?}");
            assert_eq!(0, h.timers.armed(), "order {order:?}");
        }
    }

    #[test]
    fn teardown_completes_everything() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        port.set_wait_mask(SerialEvents::RxChar).unwrap();
        let wait = port.wait_on_mask().unwrap();
        let r1 = port.read(4);
        let r2 = port.read(4);
        let w = port.write(b"bye".to_vec());

        h.device.remove().unwrap();
        for req in [&r1, &r2, &w, &wait] {
            assert_eq!(Status::Cancelled, req.completion().unwrap().status);
        }
        for pipe in Pipe::ALL {
            assert_eq!(0, h.device.pending_transfers(pipe));
            assert_eq!(0, h.transport.outstanding(pipe));
        }
        assert!(!h.device.is_running());
        assert_eq!(Status::Unsuccessful, port.read(1).completion().unwrap().status);
    }

    #[test]
    fn teardown_bounded_by_abort_timeout() {
        let mut config = Config::default();
        config.abort_timeout = Duration::from_millis(10);
        let h = Harness::with_config(config);
        h.transport.ignore_abort(true);
        assert!(matches!(
            h.device.remove(),
            Err(Error::AbortTimeout(Pipe::DataIn))
        ));
        h.transport.ignore_abort(false);
        assert!(h.device.remove().is_ok());
    }

    #[test]
    fn restart_after_teardown() {
        let h = Harness::new();
        h.device.remove().unwrap();
        h.device.start().unwrap();
        h.settle();
        assert!(h.device.is_running());
        let port = h.device.open().unwrap();
        let req = port.read(2);
        h.rx(b"ok");
        assert_eq!(b"ok".to_vec(), req.completion().unwrap().data);
    }

    #[test]
    fn threaded_services_drive_timeouts() {
        let transport = Arc::new(MockTransport::default());
        let services = Services {
            transport: transport.clone(),
            timers: Arc::new(crate::timer::ThreadTimer::new().unwrap()),
            work: Arc::new(crate::work::ThreadWorkQueue::new().unwrap()),
            slots: Arc::new(DeviceSlots::default()),
        };
        let device = Device::new(services, Config::default()).unwrap();
        device.start().unwrap();
        let port = device.open().unwrap();
        port.set_timeouts(SerialTimeouts {
            read_total_timeout_constant: 20,
            ..Default::default()
        })
        .unwrap();
        let c = futures_lite::future::block_on(port.read(8));
        assert_eq!(Status::Timeout, c.status);
    }
}
