//! The event loop and its thread-safe handle.
//!
//! A loop is bound to exactly one thread for its whole life. The loop object
//! itself is not `Send`; everything other threads need (task submission,
//! shutdown, waking) goes through the shared [`LoopHandle`].

use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Result;
use crate::poller::{new_default_multiplexer, Multiplexer, ReadyList};

/// Deferred work submitted to a loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    /// One loop per thread, enforced at construction.
    static LOOP_BOUND: Cell<bool> = const { Cell::new(false) };
}

/// Shareable face of a loop. Cheap to clone via `Arc`, safe to use from any
/// thread.
pub struct LoopHandle {
    thread: ThreadId,
    multiplexer: Arc<dyn Multiplexer>,
    pending: Mutex<Vec<Task>>,
    draining: AtomicBool,
    stopped: AtomicBool,
}

impl LoopHandle {
    fn new(multiplexer: Arc<dyn Multiplexer>) -> Arc<Self> {
        Arc::new(LoopHandle {
            thread: thread::current().id(),
            multiplexer,
            pending: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_with_multiplexer(multiplexer: Arc<dyn Multiplexer>) -> Arc<Self> {
        Self::new(multiplexer)
    }

    /// Whether the caller is running on the loop's own thread.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    /// Runs `task` immediately when called from the loop thread, otherwise
    /// queues it for the loop's next drain.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` unconditionally, even from the loop thread. A task
    /// queued from within a readiness callback runs in the drain at the end
    /// of the same iteration; one queued from within another task runs in
    /// the next drain.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().unwrap().push(Box::new(task));
        // A foreign thread always wakes; the loop thread only needs it when
        // the drain already swapped the queue out, or this push would sit
        // until the poll timeout.
        if !self.is_in_loop_thread() || self.draining.load(Ordering::SeqCst) {
            self.multiplexer.wake();
        }
    }

    /// Asks the loop to exit after its current iteration. Idempotent.
    pub fn quit(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.multiplexer.wake();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The loop proper. Lives and dies on one thread.
pub struct EventLoop {
    handle: Arc<LoopHandle>,
    looping: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl EventLoop {
    /// Binds a new loop to the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<Self> {
        LOOP_BOUND.with(|bound| {
            if bound.get() {
                panic!("a second event loop on thread {:?}", thread::current().id());
            }
            bound.set(true);
        });
        let multiplexer = new_default_multiplexer()?;
        debug!("event loop created on {:?}", thread::current().id());
        Ok(EventLoop {
            handle: LoopHandle::new(multiplexer),
            looping: false,
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn handle(&self) -> Arc<LoopHandle> {
        Arc::clone(&self.handle)
    }

    /// Runs until [`LoopHandle::quit`] is called. Each iteration waits for
    /// readiness, dispatches every ready source, then drains queued tasks.
    pub fn run(&mut self) {
        assert!(!self.looping, "event loop already running");
        assert!(self.handle.is_in_loop_thread());
        self.looping = true;
        trace!("event loop starting");

        let mut ready = ReadyList::new();
        while !self.handle.stopped.load(Ordering::SeqCst) {
            ready.clear();
            let at = self.handle.multiplexer.wait(POLL_TIMEOUT, &mut ready);
            for (source, readiness) in ready.drain(..) {
                source.dispatch(readiness, at);
            }
            self.drain_pending();
        }

        self.looping = false;
        trace!("event loop stopped");
    }

    fn drain_pending(&self) {
        self.handle.draining.store(true, Ordering::SeqCst);
        // Swap the whole queue out so tasks can queue more work without
        // deadlocking on the pending lock.
        let tasks = mem::take(&mut *self.handle.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.handle.draining.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        LOOP_BOUND.with(|bound| bound.set(false));
    }
}
