//! Caller-issued requests and the rundown discipline guarding their completion.
//!
//! Every read, write or wait-on-mask call produces an [`IoRequest`]. The
//! caller holds one clone of the handle and the device keeps another while the
//! request is queued or parked. A request reaches its terminal [`Completion`]
//! exactly once; later completion attempts are ignored and logged.
//!
//! A parked request may be finished by several independent sources (explicit
//! cancellation, the interval timer, the total timer, arriving data). Each
//! source that may still fire holds a bit in the request's [`RequestRefs`];
//! the final completion happens only once every bit has been retired.

use bitflags::bitflags;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use crate::events::SerialEvents;

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The request was fully satisfied
    Success,
    /// The request was cancelled by its caller, a purge or device teardown
    Cancelled,
    /// An interval or total timeout expired. Partial data is preserved.
    Timeout,
    /// The USB transfer failed or the device is not operational
    Unsuccessful,
    /// A transfer context could not be allocated
    InsufficientResources,
    /// The device went away while the request was outstanding
    DeviceRemoved,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::Cancelled => "cancelled",
            Status::Timeout => "timeout",
            Status::Unsuccessful => "unsuccessful",
            Status::InsufficientResources => "insufficient resources",
            Status::DeviceRemoved => "device removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    WaitOnMask,
}

bitflags! {
    /// Completion sources still holding a reference on a parked request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestRefs: u8 {
        /// A cancel routine is installed
        const CancelPending = 0b001;
        /// The inter-character timer is armed
        const IntervalTimerPending = 0b010;
        /// The total timer is armed
        const TotalTimerPending = 0b100;
    }
}

impl RequestRefs {
    /// Clear `refs` and report whether no reference is left.
    pub fn retire(&mut self, refs: RequestRefs) -> bool {
        self.remove(refs);
        self.is_empty()
    }
}

/// Final result handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    /// Number of bytes transferred (or 4 for a wait-on-mask result)
    pub information: usize,
    /// Bytes read, or the event mask for a wait-on-mask request
    pub data: Vec<u8>,
}

impl Completion {
    /// Event mask reported by a wait-on-mask request
    pub fn events(&self) -> Option<SerialEvents> {
        let raw: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(SerialEvents::from_bits_retain(u32::from_le_bytes(raw)))
    }
}

// ---------- Cancel lock

/// Process-wide lock serializing cancel routine installation against
/// cancellation. Always taken before the device lock.
static CANCEL_LOCK: Mutex<()> = Mutex::new(());

/// Proof that the process-wide cancel lock is held
pub(crate) struct CancelGuard {
    _guard: MutexGuard<'static, ()>,
}

pub(crate) fn acquire_cancel_lock() -> CancelGuard {
    CancelGuard {
        _guard: CANCEL_LOCK.lock().unwrap_or_else(PoisonError::into_inner),
    }
}

/// Invoked with the cancel lock held. The routine owns the guard and may drop
/// it early to do work that must not run under the lock.
pub(crate) type CancelRoutine = Box<dyn FnOnce(CancelGuard, &IoRequest) + Send>;

// ---------- Requests

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

struct RequestState {
    cancelled: bool,
    cancel_routine: Option<CancelRoutine>,
    refs: RequestRefs,
    buffer: Vec<u8>,
    information: usize,
    completion: Option<Completion>,
    waker: Option<Waker>,
}

struct Shared {
    id: u64,
    kind: RequestKind,
    length: usize,
    state: Mutex<RequestState>,
    done: Condvar,
}

/// Handle on an outstanding serial request
///
/// Clones refer to the same request. Await it, or call [`IoRequest::wait`], to
/// obtain the [`Completion`].
#[derive(Clone)]
pub struct IoRequest(Arc<Shared>);

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("length", &self.0.length)
            .finish()
    }
}

impl IoRequest {
    pub(crate) fn new(kind: RequestKind, buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self(Arc::new(Shared {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            length,
            state: Mutex::new(RequestState {
                cancelled: false,
                cancel_routine: None,
                refs: RequestRefs::empty(),
                buffer,
                information: 0,
                completion: None,
                waker: None,
            }),
            done: Condvar::new(),
        }))
    }

    /// Request that finished before ever being queued
    pub(crate) fn finished(kind: RequestKind, status: Status) -> Self {
        let request = Self::new(kind, Vec::new());
        request.complete(status);
        request
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn kind(&self) -> RequestKind {
        self.0.kind
    }

    /// Number of bytes requested
    pub fn length(&self) -> usize {
        self.0.length
    }

    pub(crate) fn is(&self, other: &IoRequest) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Ask for the request to be cancelled.
    ///
    /// Returns `false` if the request had already completed or no cancel
    /// routine was installed; in the latter case the cancellation is noticed
    /// when the request is next picked up.
    pub fn cancel(&self) -> bool {
        let guard = acquire_cancel_lock();
        let routine = {
            let mut st = self.state();
            if st.completion.is_some() {
                return false;
            }
            st.cancelled = true;
            st.cancel_routine.take()
        };

        match routine {
            Some(routine) => {
                tracing::debug!(id = self.0.id, kind = ?self.0.kind, "cancelling request");
                routine(guard, self);
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state().completion.is_some()
    }

    pub fn completion(&self) -> Option<Completion> {
        self.state().completion.clone()
    }

    /// Block until the request completes
    pub fn wait(&self) -> Completion {
        let mut st = self.state();
        loop {
            if let Some(completion) = &st.completion {
                return completion.clone();
            }
            st = self
                .0
                .done
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the request completes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        let st = self.state();
        let (st, _) = self
            .0
            .done
            .wait_timeout_while(st, timeout, |st| st.completion.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        st.completion.clone()
    }

    // ----- Device-side operations

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Swap the cancel routine, returning the previous one. `None` coming back
    /// while one was expected means a cancellation already claimed it.
    pub(crate) fn set_cancel_routine(
        &self,
        _held: &CancelGuard,
        routine: Option<CancelRoutine>,
    ) -> Option<CancelRoutine> {
        let mut st = self.state();
        std::mem::replace(&mut st.cancel_routine, routine)
    }

    pub(crate) fn refs(&self) -> RequestRefs {
        self.state().refs
    }

    pub(crate) fn add_refs(&self, refs: RequestRefs) {
        self.state().refs.insert(refs);
    }

    /// Retire `refs`; `true` when nothing else holds the request.
    pub(crate) fn retire(&self, refs: RequestRefs) -> bool {
        self.state().refs.retire(refs)
    }

    pub(crate) fn information(&self) -> usize {
        self.state().information
    }

    pub(crate) fn set_information(&self, information: usize) {
        self.state().information = information;
    }

    /// Bytes still wanted by a read
    pub(crate) fn remaining(&self) -> usize {
        let st = self.state();
        st.buffer.len().saturating_sub(st.information)
    }

    /// Run `fill` on the unfilled tail of the buffer, advancing by the count it returns.
    pub(crate) fn fill(&self, fill: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let mut st = self.state();
        let start = st.information;
        let copied = fill(&mut st.buffer[start..]);
        st.information += copied;
        copied
    }

    /// Clamp the requested length (the "crunch down to one byte" policy)
    pub(crate) fn truncate(&self, length: usize) {
        self.state().buffer.truncate(length);
    }

    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().buffer)
    }

    pub(crate) fn set_buffer(&self, buffer: Vec<u8>) {
        let mut st = self.state();
        st.information = buffer.len();
        st.buffer = buffer;
    }

    /// Deliver the terminal completion. Returns `false` (and changes nothing)
    /// if the request was already complete.
    pub(crate) fn complete(&self, status: Status) -> bool {
        let waker = {
            let mut st = self.state();
            if st.completion.is_some() {
                tracing::error!(id = self.0.id, ?status, "request completed twice");
                debug_assert!(false, "request {} completed twice", self.0.id);
                return false;
            }
            st.cancel_routine = None;
            let mut data = std::mem::take(&mut st.buffer);
            data.truncate(st.information);
            st.completion = Some(Completion {
                status,
                information: st.information,
                data,
            });
            st.waker.take()
        };

        tracing::trace!(id = self.0.id, kind = ?self.0.kind, %status, "request complete");
        self.0.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl Future for IoRequest {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        let mut st = self.state();
        match &st.completion {
            Some(completion) => Poll::Ready(completion.clone()),
            None => {
                st.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
