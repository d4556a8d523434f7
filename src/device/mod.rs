//! The per-device serial core.
//!
//! All mutable state lives in one [`DeviceState`] behind a single mutex. Paths
//! that may complete or start requests take the process-wide cancel lock first
//! and the device lock second. Neither lock is held while calling into the
//! transfer service's `cancel`/`abort_pipe` or while doing control transfers.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
    time::Duration,
};

use crate::{
    cdc::{DtrRts, Handflow, LineCoding, SerialChars},
    events::{ModemStatus, PerfStats, SerialErrors, SerialEvents, SerialState},
    request::{acquire_cancel_lock, IoRequest, Status},
    ring::RxStore,
    slots::{device_name, DeviceSlots},
    timeouts::SerialTimeouts,
    timer::TimerService,
    transport::{PendingTransfers, Pipe, UsbTransport},
    work::WorkQueue,
    Error, Result,
};

mod control;
mod notify;
mod read;
mod write;

use read::CurrentRead;

/// Tunables for one device
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Size of the receive store
    pub rx_capacity: usize,
    /// Bulk-in transfers pause while the receive store holds more than this
    pub rx_high_water: usize,
    /// Size requested by each bulk-in transfer
    pub in_transfer_size: usize,
    /// Size requested by each interrupt-in transfer
    pub notify_transfer_size: usize,
    /// How long teardown waits for a pipe to drain
    pub abort_timeout: Duration,
    /// Bound on synchronous class control requests
    pub control_timeout: Duration,
    /// Line coding assumed until the device reports its own
    pub default_line_coding: LineCoding,
}

impl Default for Config {
    fn default() -> Self {
        const RX_CAPACITY: usize = 4096;
        Self {
            rx_capacity: RX_CAPACITY,
            rx_high_water: RX_CAPACITY / 4 * 3,
            in_transfer_size: 64,
            notify_transfer_size: 16,
            abort_timeout: Duration::from_secs(5),
            control_timeout: Duration::from_secs(5),
            default_line_coding: LineCoding::default(),
        }
    }
}

/// Device power level. Only `D0` permits I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    D0,
    D1,
    D2,
    D3,
}

/// Collaborators a device is wired to
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn UsbTransport>,
    pub timers: Arc<dyn TimerService>,
    pub work: Arc<dyn WorkQueue>,
    pub slots: Arc<DeviceSlots>,
}

/// Slot table shared by devices that don't bring their own
pub fn global_slots() -> Arc<DeviceSlots> {
    static SLOTS: OnceLock<Arc<DeviceSlots>> = OnceLock::new();
    SLOTS.get_or_init(|| Arc::new(DeviceSlots::default())).clone()
}

/// Read pump progress
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ReadingState {
    /// No bulk-in transfer outstanding
    Idle,
    /// A bulk-in transfer is outstanding
    Started,
    /// The completion handler is running
    Completing,
    /// Someone asked for a new transfer while one was outstanding
    Restart,
}

pub(crate) struct DeviceState {
    running: bool,
    power: PowerState,
    open_count: u32,

    rx: RxStore,
    reading_on: bool,
    reading: ReadingState,
    current_read: Option<CurrentRead>,
    read_queue: VecDeque<IoRequest>,

    isr_wait_mask: SerialEvents,
    history_mask: SerialEvents,
    mask_request: Option<IoRequest>,

    notify_active: bool,
    notify_restart_pending: bool,
    serial_state: SerialState,
    modem_status: ModemStatus,
    errors: SerialErrors,
    stats: PerfStats,

    pending_writes: usize,
    out_queue_bytes: usize,

    timeouts: SerialTimeouts,
    line_coding: LineCoding,
    chars: SerialChars,
    handflow: Handflow,
    dtr_rts: DtrRts,
}

impl DeviceState {
    fn new(config: &Config) -> Self {
        Self {
            running: false,
            power: PowerState::D0,
            open_count: 0,
            rx: RxStore::new(config.rx_capacity),
            reading_on: false,
            reading: ReadingState::Idle,
            current_read: None,
            read_queue: VecDeque::new(),
            isr_wait_mask: SerialEvents::empty(),
            history_mask: SerialEvents::empty(),
            mask_request: None,
            notify_active: false,
            notify_restart_pending: false,
            serial_state: SerialState::empty(),
            modem_status: ModemStatus::empty(),
            errors: SerialErrors::empty(),
            stats: PerfStats::default(),
            pending_writes: 0,
            out_queue_bytes: 0,
            timeouts: SerialTimeouts::default(),
            line_coding: config.default_line_coding,
            chars: SerialChars::default(),
            handflow: Handflow::default(),
            dtr_rts: DtrRts::empty(),
        }
    }

    fn operational(&self) -> bool {
        self.running && self.power == PowerState::D0
    }
}

pub(crate) struct Shared {
    index: usize,
    name: String,
    config: Config,
    transport: Arc<dyn UsbTransport>,
    timers: Arc<dyn TimerService>,
    work: Arc<dyn WorkQueue>,
    slots: Arc<DeviceSlots>,
    pending: PendingTransfers,
    state: Mutex<DeviceState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device-control operations need a powered device
    fn power_gate(&self) -> Result<()> {
        let power = self.state().power;
        if power != PowerState::D0 {
            tracing::debug!(device = %self.name, ?power, "rejecting request, device not in D0");
            return Err(Error::PowerOff);
        }
        Ok(())
    }

    /// Queue `f` on the work queue against a weak handle
    fn defer(self: &Arc<Self>, f: impl FnOnce(&Arc<Shared>) + Send + 'static) {
        let weak: Weak<Shared> = Arc::downgrade(self);
        self.work.queue(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                f(&shared);
            }
        }));
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state();
            if st.running {
                return Ok(());
            }
            st.running = true;
            st.reading_on = true;
        }
        tracing::debug!(device = %self.name, "starting");

        // The device's own line coding wins over the configured default
        if let Err(err) = self.refresh_line_coding() {
            tracing::warn!(device = %self.name, "cannot read line coding: {err}");
        }

        self.restart_read();
        self.restart_notify();
        Ok(())
    }

    fn set_power_state(self: &Arc<Self>, power: PowerState) {
        let resume = {
            let mut st = self.state();
            let previous = std::mem::replace(&mut st.power, power);
            tracing::debug!(device = %self.name, ?previous, ?power, "power state change");
            power == PowerState::D0 && previous != PowerState::D0 && st.running
        };
        if resume {
            self.restart_read();
            self.restart_notify();
        }
    }

    /// Complete everything outstanding, stop the pumps and wait for the pipes to drain.
    fn remove(self: &Arc<Self>) -> Result<()> {
        {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            st.running = false;
            st.reading_on = false;
            st.notify_restart_pending = false;
            self.kill_all_reads(&cancel, &mut st, Status::Cancelled);
            self.cancel_wait(&cancel, &mut st, Status::Cancelled);
        }
        tracing::debug!(device = %self.name, "removing, aborting pipes");

        let mut result = Ok(());
        for pipe in Pipe::ALL {
            self.transport.abort_pipe(pipe);
            if !self.pending.wait_drained(pipe, self.config.abort_timeout) {
                tracing::error!(
                    device = %self.name,
                    ?pipe,
                    outstanding = self.pending.count(pipe),
                    "pipe did not drain"
                );
                if result.is_ok() {
                    result = Err(Error::AbortTimeout(pipe));
                }
            }
        }
        result
    }

    fn open(self: &Arc<Self>) -> Result<SerialPort> {
        let mut st = self.state();
        if !st.running {
            return Err(Error::NotRunning);
        }
        if st.open_count != 0 {
            tracing::debug!(device = %self.name, "rejecting second open");
            return Err(Error::AlreadyOpen);
        }
        st.open_count = 1;
        st.history_mask = SerialEvents::empty();
        st.isr_wait_mask = SerialEvents::empty();
        tracing::debug!(device = %self.name, "opened");
        Ok(SerialPort {
            shared: self.clone(),
            closed: false,
        })
    }

    /// Tear down I/O issued through the open handle and drop DTR
    fn close(self: &Arc<Self>) {
        {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            if st.open_count == 0 {
                return;
            }
            st.open_count = 0;
            self.kill_all_reads(&cancel, &mut st, Status::Cancelled);
            self.cancel_wait(&cancel, &mut st, Status::Cancelled);
            st.isr_wait_mask = SerialEvents::empty();
            st.history_mask = SerialEvents::empty();
        }
        self.transport.abort_pipe(Pipe::DataOut);
        if let Err(err) = self.clear_dtr() {
            tracing::debug!(device = %self.name, "cannot clear DTR on close: {err}");
        }
        tracing::debug!(device = %self.name, "closed");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.slots.release(self.index);
    }
}

/// An attached CDC-ACM device
///
/// Dropping the device tears it down.
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    pub fn new(services: Services, config: Config) -> Result<Self> {
        let index = services.slots.allocate().ok_or(Error::NoSlot)?;
        let name = device_name(index);
        tracing::debug!(device = %name, "created");
        let state = Mutex::new(DeviceState::new(&config));
        Ok(Self {
            shared: Arc::new(Shared {
                index,
                name,
                config,
                transport: services.transport,
                timers: services.timers,
                work: services.work,
                slots: services.slots,
                pending: PendingTransfers::default(),
                state,
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    pub fn power_state(&self) -> PowerState {
        self.shared.state().power
    }

    /// Begin polling the bulk-in and interrupt-in pipes
    pub fn start(&self) -> Result<()> {
        self.shared.start()
    }

    pub fn set_power_state(&self, power: PowerState) {
        self.shared.set_power_state(power)
    }

    /// Cancel all outstanding requests and abort the pipes
    pub fn remove(&self) -> Result<()> {
        self.shared.remove()
    }

    /// Open the port. Only one handle may be open at a time.
    pub fn open(&self) -> Result<SerialPort> {
        self.shared.open()
    }

    /// Outstanding transfers on `pipe`
    pub fn pending_transfers(&self, pipe: Pipe) -> usize {
        self.shared.pending.count(pipe)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let running = self.shared.state().running;
        if running {
            if let Err(err) = self.shared.remove() {
                tracing::warn!(device = %self.shared.name, "teardown on drop: {err}");
            }
        }
    }
}

/// Open handle on a device, the caller-facing serial surface
///
/// Dropping the handle closes it.
pub struct SerialPort {
    shared: Arc<Shared>,
    closed: bool,
}

impl SerialPort {
    /// Read up to `length` bytes
    pub fn read(&self, length: usize) -> IoRequest {
        self.shared.read(length)
    }

    /// Write `data` with one bulk-out transfer
    pub fn write(&self, data: Vec<u8>) -> IoRequest {
        self.shared.write(data)
    }

    /// Choose the events `wait_on_mask` reports
    pub fn set_wait_mask(&self, mask: SerialEvents) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.set_wait_mask(mask.bits())
    }

    /// As [`SerialPort::set_wait_mask`], validating a raw mask
    pub fn set_wait_mask_raw(&self, mask: u32) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.set_wait_mask(mask)
    }

    pub fn get_wait_mask(&self) -> Result<SerialEvents> {
        self.shared.power_gate()?;
        Ok(self.shared.state().isr_wait_mask)
    }

    /// Wait for one of the subscribed events
    pub fn wait_on_mask(&self) -> Result<IoRequest> {
        self.shared.power_gate()?;
        self.shared.wait_on_mask()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Close the handle, cancelling its outstanding I/O
    pub fn close(mut self) {
        self.closed = true;
        self.shared.close();
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::Harness;

    #[test]
    fn single_open() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        assert!(matches!(h.device.open(), Err(Error::AlreadyOpen)));
        drop(port);
        assert!(h.device.open().is_ok());
    }

    #[test]
    fn open_requires_start() {
        let h = Harness::unstarted(Config::default());
        assert!(matches!(h.device.open(), Err(Error::NotRunning)));
        h.device.start().unwrap();
        h.settle();
        assert!(h.device.open().is_ok());
    }

    #[test]
    fn start_submits_both_pumps() {
        let h = Harness::new();
        assert_eq!(1, h.transport.outstanding(Pipe::DataIn));
        assert_eq!(1, h.transport.outstanding(Pipe::Notify));
        assert_eq!(1, h.device.pending_transfers(Pipe::DataIn));
        assert_eq!(1, h.device.pending_transfers(Pipe::Notify));
    }

    #[test]
    fn slot_released_on_drop() {
        let h = Harness::new();
        let slots = h.slots.clone();
        assert_eq!(1, slots.in_use());
        assert_eq!("USBSER000", h.device.name());
        drop(h);
        assert_eq!(0, slots.in_use());
    }

    #[test]
    fn slots_exhausted() {
        let h = Harness::new();
        let services = h.services_with_slots(Arc::new(DeviceSlots::new(0)));
        assert!(matches!(
            Device::new(services, Config::default()),
            Err(Error::NoSlot)
        ));
    }

    #[test]
    fn power_gate_blocks_control() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        h.device.set_power_state(PowerState::D3);
        assert!(matches!(
            port.set_wait_mask(SerialEvents::RxChar),
            Err(Error::PowerOff)
        ));
        h.device.set_power_state(PowerState::D0);
        assert!(port.set_wait_mask(SerialEvents::RxChar).is_ok());
    }

    #[test]
    fn close_clears_dtr() {
        let h = Harness::new();
        let port = h.device.open().unwrap();
        port.set_dtr().unwrap();
        port.close();
        let last = h.transport.control_log().pop().unwrap();
        assert_eq!(crate::cdc::ClassRequest::SetControlLineState, last.0);
        assert_eq!(0, last.1);
    }
}
