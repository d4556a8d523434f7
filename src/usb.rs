//! [`UsbTransport`] over `nusb`.
//!
//! Each pipe gets a worker thread owning the endpoint's `nusb` [`Queue`] and
//! running transfers through it one at a time. Waiting on the queue is raced
//! against a cancel signal; when the signal wins the queue is cancelled and
//! the transfer reaped with whatever it moved before the cancel.

use futures_lite::future::{self, block_on};
use nusb::{
    transfer::{
        Completion, Control, ControlType, Direction, EndpointType, Queue, Recipient,
        RequestBuffer, ResponseBuffer, TransferError,
    },
    Interface,
};
use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    cdc::ClassRequest,
    device::{global_slots, Config, Device, Services},
    timer::ThreadTimer,
    transport::{Pipe, TransferBuffer, TransferCallback, TransferCompletion, TransferId, UsbTransport},
    work::ThreadWorkQueue,
    Error, Result,
};

// ---------- Interface Descriptors

const COMM_INTERFACE_CLASS: u8 = 0x02; // Communications
const COMM_SUBCLASS_ACM: u8 = 0x02; // Abstract Control Model
const DATA_INTERFACE_CLASS: u8 = 0x0A; // CDC Data

// ---------- Cancellation

#[derive(Default)]
struct CancelInner {
    queued: HashSet<TransferId>,
    cancelled_queued: HashSet<TransferId>,
    current: Option<TransferId>,
    current_cancelled: bool,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Cancels(Mutex<CancelInner>);

impl Cancels {
    fn lock(&self) -> MutexGuard<'_, CancelInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, id: TransferId) {
        let mut inner = self.lock();
        if inner.current == Some(id) {
            inner.current_cancelled = true;
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        } else if inner.queued.contains(&id) {
            inner.cancelled_queued.insert(id);
        }
    }

    fn cancel_all(&self) {
        let mut inner = self.lock();
        let queued: Vec<TransferId> = inner.queued.iter().copied().collect();
        inner.cancelled_queued.extend(queued);
        if inner.current.is_some() {
            inner.current_cancelled = true;
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
    }

    /// Move `id` from the queue to the bus. `false` if it was cancelled while queued.
    fn begin(&self, id: TransferId) -> bool {
        let mut inner = self.lock();
        inner.queued.remove(&id);
        if inner.cancelled_queued.remove(&id) {
            return false;
        }
        inner.current = Some(id);
        inner.current_cancelled = false;
        true
    }

    fn end(&self) {
        let mut inner = self.lock();
        inner.current = None;
        inner.current_cancelled = false;
        inner.waker = None;
    }
}

/// Resolves once the running transfer is cancelled
struct CancelSignal<'a>(&'a Cancels);

impl Future for CancelSignal<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.0.lock();
        if inner.current_cancelled {
            Poll::Ready(())
        } else {
            inner.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

// ---------- Endpoints

#[derive(Clone)]
enum Endpoint {
    BulkIn {
        interface: Interface,
        address: u8,
        packet_size: usize,
    },
    BulkOut {
        interface: Interface,
        address: u8,
    },
    InterruptIn {
        interface: Interface,
        address: u8,
        packet_size: usize,
    },
}

/// IN requests must be whole packets
fn round_to_packet(len: usize, packet_size: usize) -> usize {
    let packet_size = packet_size.max(1);
    len.max(1).div_ceil(packet_size) * packet_size
}

fn cancelled() -> TransferCompletion {
    TransferCompletion {
        status: Err(TransferError::Cancelled),
        data: Vec::new(),
        actual_length: 0,
    }
}

impl Endpoint {
    fn accepts(&self, buffer: &TransferBuffer) -> bool {
        matches!(
            (self, buffer),
            (Endpoint::BulkIn { .. } | Endpoint::InterruptIn { .. }, TransferBuffer::In(_))
                | (Endpoint::BulkOut { .. }, TransferBuffer::Out(_))
        )
    }

    fn queue(&self) -> PipeQueue {
        match self {
            Endpoint::BulkIn {
                interface,
                address,
                packet_size,
            } => PipeQueue::In {
                queue: interface.bulk_in_queue(*address),
                packet_size: *packet_size,
            },
            Endpoint::InterruptIn {
                interface,
                address,
                packet_size,
            } => PipeQueue::In {
                queue: interface.interrupt_in_queue(*address),
                packet_size: *packet_size,
            },
            Endpoint::BulkOut { interface, address } => {
                PipeQueue::Out(interface.bulk_out_queue(*address))
            }
        }
    }
}

/// The two `nusb` queue flavors a pipe can own
trait PendingQueue {
    type Response;

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Completion<Self::Response>>;
    fn cancel_all(&mut self);
}

impl PendingQueue for Queue<RequestBuffer> {
    type Response = Vec<u8>;

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Completion<Vec<u8>>> {
        Queue::poll_next(self, cx)
    }

    fn cancel_all(&mut self) {
        Queue::cancel_all(self)
    }
}

impl PendingQueue for Queue<Vec<u8>> {
    type Response = ResponseBuffer;

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Completion<ResponseBuffer>> {
        Queue::poll_next(self, cx)
    }

    fn cancel_all(&mut self) {
        Queue::cancel_all(self)
    }
}

/// Wait for the transfer in flight on `queue`. If the cancel signal fires
/// first the queue is cancelled and the transfer reaped, partial data and all.
fn reap<Q: PendingQueue>(queue: &mut Q, cancels: &Cancels) -> Completion<Q::Response> {
    let raced = block_on(future::or(
        async { Some(future::poll_fn(|cx| queue.poll_next(cx)).await) },
        async {
            CancelSignal(cancels).await;
            None
        },
    ));
    match raced {
        Some(completion) => completion,
        None => {
            queue.cancel_all();
            block_on(future::poll_fn(|cx| queue.poll_next(cx)))
        }
    }
}

enum PipeQueue {
    In {
        queue: Queue<RequestBuffer>,
        packet_size: usize,
    },
    Out(Queue<Vec<u8>>),
}

impl PipeQueue {
    fn transfer(&mut self, buffer: TransferBuffer, cancels: &Cancels) -> TransferCompletion {
        match (self, buffer) {
            (PipeQueue::In { queue, packet_size }, TransferBuffer::In(len)) => {
                queue.submit(RequestBuffer::new(round_to_packet(len, *packet_size)));
                let c = reap(queue, cancels);
                TransferCompletion {
                    status: c.status,
                    actual_length: c.data.len(),
                    data: c.data,
                }
            }
            (PipeQueue::Out(queue), TransferBuffer::Out(data)) => {
                queue.submit(data);
                let c = reap(queue, cancels);
                TransferCompletion {
                    status: c.status,
                    data: Vec::new(),
                    actual_length: c.data.actual_length(),
                }
            }
            // Filtered out by submit
            _ => TransferCompletion {
                status: Err(TransferError::Unknown),
                data: Vec::new(),
                actual_length: 0,
            },
        }
    }
}

// ---------- Pipe workers

struct Job {
    id: TransferId,
    buffer: TransferBuffer,
    on_complete: TransferCallback,
}

struct PipeWorker {
    endpoint: Endpoint,
    cancels: Arc<Cancels>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Option<JoinHandle<()>>,
}

impl PipeWorker {
    fn spawn(pipe: Pipe, endpoint: Endpoint) -> std::io::Result<Self> {
        let cancels = Arc::new(Cancels::default());
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = {
            let cancels = cancels.clone();
            let endpoint = endpoint.clone();
            thread::Builder::new()
                .name(format!("nusbser-{pipe:?}"))
                .spawn(move || {
                    let mut queue = endpoint.queue();
                    for job in receiver {
                        run_job(&mut queue, &cancels, job);
                    }
                })?
        };
        Ok(Self {
            endpoint,
            cancels,
            sender: Mutex::new(Some(sender)),
            thread: Some(thread),
        })
    }
}

fn run_job(queue: &mut PipeQueue, cancels: &Cancels, job: Job) {
    let Job {
        id,
        buffer,
        on_complete,
    } = job;
    if !cancels.begin(id) {
        on_complete(cancelled());
        return;
    }
    let completion = queue.transfer(buffer, cancels);
    cancels.end();
    on_complete(completion);
}

impl Drop for PipeWorker {
    fn drop(&mut self) {
        self.cancels.cancel_all();
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// A claimed CDC-ACM function
pub struct NusbTransport {
    comm: Interface,
    comm_number: u8,
    control_timeout: Duration,
    pipes: [PipeWorker; 3],
}

impl NusbTransport {
    pub fn open(vid: u16, pid: u16, control_timeout: Duration) -> Result<Self> {
        // Find the communication and data interfaces of the ACM function
        let di = nusb::list_devices()?
            .find(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
            .ok_or(Error::DeviceNotFound)?;
        let device = di.open()?;
        let configuration = device.active_configuration()?;

        let mut comm_idx = None;
        let mut data_idx = None;
        let mut notify = None;
        let mut bulk_in = None;
        let mut bulk_out = None;
        for i in configuration.interfaces() {
            for alt in i.alt_settings() {
                let is_comm =
                    alt.class() == COMM_INTERFACE_CLASS && alt.subclass() == COMM_SUBCLASS_ACM;
                let is_data = alt.class() == DATA_INTERFACE_CLASS;
                if !is_comm && !is_data {
                    continue;
                }
                for endpoint in alt.endpoints() {
                    let found = (endpoint.address(), endpoint.max_packet_size());
                    match (endpoint.direction(), endpoint.transfer_type()) {
                        (Direction::In, EndpointType::Interrupt) if is_comm => {
                            comm_idx = Some(i.interface_number());
                            notify = Some(found);
                        }
                        (Direction::In, EndpointType::Bulk) if is_data => {
                            data_idx = Some(i.interface_number());
                            bulk_in = Some(found);
                        }
                        (Direction::Out, EndpointType::Bulk) if is_data => {
                            bulk_out = Some(found.0);
                        }
                        _ => (),
                    }
                }
            }
        }

        // ACM needs the notification endpoint plus a bulk pair
        let comm_number = comm_idx.ok_or(Error::DeviceNotFound)?;
        let (notify_address, notify_packet) = notify.ok_or(Error::DeviceNotFound)?;
        let (in_address, in_packet) = bulk_in.ok_or(Error::DeviceNotFound)?;
        let out_address = bulk_out.ok_or(Error::DeviceNotFound)?;

        let comm = device.detach_and_claim_interface(comm_number)?;
        let data = device.detach_and_claim_interface(data_idx.ok_or(Error::DeviceNotFound)?)?;
        tracing::debug!(vid, pid, comm_number, "claimed CDC-ACM interfaces");

        let pipes = [
            PipeWorker::spawn(
                Pipe::DataIn,
                Endpoint::BulkIn {
                    interface: data.clone(),
                    address: in_address,
                    packet_size: in_packet,
                },
            )?,
            PipeWorker::spawn(
                Pipe::DataOut,
                Endpoint::BulkOut {
                    interface: data,
                    address: out_address,
                },
            )?,
            PipeWorker::spawn(
                Pipe::Notify,
                Endpoint::InterruptIn {
                    interface: comm.clone(),
                    address: notify_address,
                    packet_size: notify_packet,
                },
            )?,
        ];

        Ok(Self {
            comm,
            comm_number,
            control_timeout,
            pipes,
        })
    }

    fn class_request(&self, request: ClassRequest, value: u16) -> Control {
        Control {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: request as u8,
            value,
            index: u16::from(self.comm_number),
        }
    }
}

impl UsbTransport for NusbTransport {
    fn submit(
        &self,
        pipe: Pipe,
        buffer: TransferBuffer,
        on_complete: TransferCallback,
    ) -> Result<TransferId> {
        let worker = &self.pipes[pipe as usize];
        if !worker.endpoint.accepts(&buffer) {
            return Err(Error::InvalidParameter("transfer direction"));
        }
        let id = TransferId::next();
        worker.cancels.lock().queued.insert(id);
        let sender = worker.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match sender.as_ref() {
            Some(sender) => sender
                .send(Job {
                    id,
                    buffer,
                    on_complete,
                })
                .is_ok(),
            None => false,
        };
        if !sent {
            worker.cancels.lock().queued.remove(&id);
            return Err(Error::Transfer(TransferError::Disconnected));
        }
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        for worker in &self.pipes {
            worker.cancels.cancel(id);
        }
    }

    fn abort_pipe(&self, pipe: Pipe) {
        self.pipes[pipe as usize].cancels.cancel_all();
    }

    fn control_out(&self, request: ClassRequest, value: u16, data: &[u8]) -> Result<()> {
        self.comm.control_out_blocking(
            self.class_request(request, value),
            data,
            self.control_timeout,
        )?;
        Ok(())
    }

    fn control_in(&self, request: ClassRequest, value: u16, length: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0; usize::from(length)];
        let n = self.comm.control_in_blocking(
            self.class_request(request, value),
            &mut buf,
            self.control_timeout,
        )?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl Device {
    /// Claim the first CDC-ACM function with matching `vid`/`pid` and wire it
    /// to thread-backed timer and work services.
    pub fn connect(vid: u16, pid: u16, config: Config) -> Result<Self> {
        let transport = NusbTransport::open(vid, pid, config.control_timeout)?;
        let services = Services {
            transport: Arc::new(transport),
            timers: Arc::new(ThreadTimer::new()?),
            work: Arc::new(ThreadWorkQueue::new()?),
            slots: global_slots(),
        };
        Device::new(services, config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounds_in_requests_to_packets() {
        assert_eq!(64, round_to_packet(16, 64));
        assert_eq!(512, round_to_packet(64, 512));
        assert_eq!(128, round_to_packet(65, 64));
        assert_eq!(64, round_to_packet(0, 64));
    }

    #[test]
    fn cancel_before_start() {
        let cancels = Cancels::default();
        let (a, b) = (TransferId::next(), TransferId::next());
        cancels.lock().queued.extend([a, b]);
        cancels.cancel(a);
        assert!(!cancels.begin(a));
        assert!(cancels.begin(b));
        cancels.end();
    }

    #[test]
    fn signal_fires_on_cancel() {
        let cancels = Arc::new(Cancels::default());
        let id = TransferId::next();
        cancels.lock().queued.insert(id);
        assert!(cancels.begin(id));

        let canceller = {
            let cancels = cancels.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cancels.cancel(id);
            })
        };
        block_on(CancelSignal(&cancels));
        canceller.join().unwrap();
        cancels.end();
        assert!(cancels.lock().current.is_none());
    }

    #[test]
    fn abort_marks_queued_and_current() {
        let cancels = Cancels::default();
        let (a, b) = (TransferId::next(), TransferId::next());
        cancels.lock().queued.extend([a, b]);
        assert!(cancels.begin(a));
        cancels.cancel_all();
        assert!(cancels.lock().current_cancelled);
        cancels.end();
        assert!(!cancels.begin(b));
    }

    /// Never completes until cancelled, then hands back a partial buffer
    #[derive(Default)]
    struct StuckQueue {
        cancelled: bool,
    }

    impl PendingQueue for StuckQueue {
        type Response = Vec<u8>;

        fn poll_next(&mut self, _cx: &mut Context<'_>) -> Poll<Completion<Vec<u8>>> {
            if self.cancelled {
                Poll::Ready(Completion {
                    data: vec![7, 7],
                    status: Err(TransferError::Cancelled),
                })
            } else {
                Poll::Pending
            }
        }

        fn cancel_all(&mut self) {
            self.cancelled = true;
        }
    }

    #[test]
    fn cancel_reaps_through_the_queue() {
        let cancels = Arc::new(Cancels::default());
        let id = TransferId::next();
        cancels.lock().queued.insert(id);
        assert!(cancels.begin(id));

        let canceller = {
            let cancels = cancels.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cancels.cancel(id);
            })
        };
        let mut queue = StuckQueue::default();
        let c = reap(&mut queue, &cancels);
        canceller.join().unwrap();
        cancels.end();
        assert!(queue.cancelled);
        assert_eq!(Err(TransferError::Cancelled), c.status);
        assert_eq!(vec![7, 7], c.data);
    }
}
