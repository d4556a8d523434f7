//! Deferred work items.
//!
//! Transfer completions never resubmit from their own context. They queue the
//! follow-up submission here instead.

use std::{
    sync::{mpsc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

pub type WorkItem = Box<dyn FnOnce() + Send>;

pub trait WorkQueue: Send + Sync {
    /// Run `item` later, on a thread of the queue's choosing
    fn queue(&self, item: WorkItem);
}

/// Work queue drained by a single worker thread, in submission order
pub struct ThreadWorkQueue {
    sender: Mutex<Option<mpsc::Sender<WorkItem>>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadWorkQueue {
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let thread = thread::Builder::new()
            .name("nusbser-work".into())
            .spawn(move || {
                for item in receiver {
                    item();
                }
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Some(thread),
        })
    }
}

impl WorkQueue for ThreadWorkQueue {
    fn queue(&self, item: WorkItem) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(item).is_err() {
                    tracing::warn!("work queue worker is gone, dropping work item");
                }
            }
            None => tracing::warn!("work queue shut down, dropping work item"),
        }
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker once it has drained
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
