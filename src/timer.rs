//! One-shot timers used for read and write timeouts.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    pub fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Source of one-shot timers
pub trait TimerService: Send + Sync {
    /// Monotonic time since an arbitrary epoch
    fn now(&self) -> Duration;

    /// Run `callback` once `after` has elapsed. Callbacks run on a thread of the
    /// service's choosing and never from inside `schedule`.
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerId;

    /// Disarm a timer. `true` if its callback will now never run, `false` if
    /// it already ran or is running.
    fn cancel(&self, id: TimerId) -> bool;
}

#[derive(Default)]
struct TimerQueue {
    by_deadline: BTreeMap<(Duration, TimerId), TimerCallback>,
    deadlines: HashMap<TimerId, Duration>,
    shutdown: bool,
}

struct Inner {
    epoch: Instant,
    queue: Mutex<TimerQueue>,
    changed: Condvar,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn run(&self) {
        let mut queue = self.queue();
        loop {
            if queue.shutdown {
                return;
            }
            let Some((&(deadline, id), _)) = queue.by_deadline.first_key_value() else {
                queue = self.changed.wait(queue).unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = self.now();
            if deadline > now {
                let (q, _) = self
                    .changed
                    .wait_timeout(queue, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                queue = q;
                continue;
            }

            queue.deadlines.remove(&id);
            let callback = queue.by_deadline.remove(&(deadline, id));
            drop(queue);
            if let Some(callback) = callback {
                callback();
            }
            queue = self.queue();
        }
    }
}

/// Timer service backed by a dedicated thread
pub struct ThreadTimer {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn new() -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            epoch: Instant::now(),
            queue: Mutex::new(TimerQueue::default()),
            changed: Condvar::new(),
        });
        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("nusbser-timer".into())
                .spawn(move || inner.run())?
        };
        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }
}

impl TimerService for ThreadTimer {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId::next();
        let deadline = self.inner.now().saturating_add(after);
        let mut queue = self.inner.queue();
        queue.by_deadline.insert((deadline, id), callback);
        queue.deadlines.insert(id, deadline);
        self.inner.changed.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut queue = self.inner.queue();
        match queue.deadlines.remove(&id) {
            Some(deadline) => queue.by_deadline.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.inner.queue().shutdown = true;
        self.inner.changed.notify_one();
        if let Some(thread) = self.thread.take() {
            // A callback dropping the last handle runs on the timer thread itself
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
