//! A dedicated OS thread hosting one event loop.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::event_loop::{EventLoop, LoopHandle};

/// Hook run on the loop's own thread before the loop is published to the
/// starter. Used for per-thread setup such as naming or affinity.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<LoopHandle>) + Send + Sync>;

/// Owns a spawned thread and the loop running on it. Dropping a started
/// `LoopThread` asks the loop to quit and joins the thread.
pub struct LoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    handle: Option<Arc<LoopHandle>>,
    thread: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        LoopThread {
            name: name.into(),
            init,
            handle: None,
            thread: None,
        }
    }

    /// Spawns the thread and blocks until its loop is constructed and about
    /// to run, then returns the loop's handle.
    pub fn start(&mut self) -> Arc<LoopHandle> {
        assert!(self.thread.is_none(), "loop thread started twice");

        let rendezvous = Arc::new((Mutex::new(None::<Arc<LoopHandle>>), Condvar::new()));
        let their_side = Arc::clone(&rendezvous);
        let init = self.init.clone();
        let name = self.name.clone();

        let builder = thread::Builder::new().name(name.clone());
        let spawned = builder.spawn(move || {
            let mut event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    // A loop thread without a loop cannot serve anything it
                    // was promised to; the process state is unrecoverable.
                    error!("loop thread {} failed to build its loop: {}", name, e);
                    std::process::abort();
                }
            };
            let handle = event_loop.handle();
            if let Some(init) = init {
                init(&handle);
            }

            let (slot, ready) = &*their_side;
            *slot.lock().unwrap() = Some(handle);
            ready.notify_one();

            event_loop.run();
            info!("loop thread {} exiting", name);
        });
        self.thread = Some(spawned.unwrap_or_else(|e| panic!("spawn failed: {}", e)));

        let (slot, ready) = &*rendezvous;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }
        let handle = guard.take().expect("loop published under the condvar");
        self.handle = Some(Arc::clone(&handle));
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn start_returns_a_live_foreign_loop() {
        let mut lt = LoopThread::new("worker-test", None);
        let handle = lt.start();
        assert!(!handle.is_in_loop_thread());

        let (tx, rx) = mpsc::channel();
        handle.run_in_loop(move || {
            tx.send(thread::current().name().map(String::from)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("worker-test"));
    }

    #[test]
    fn init_hook_runs_before_start_returns() {
        let hooked = Arc::new(AtomicBool::new(false));
        let flag = hooked.clone();
        let init: ThreadInitCallback = Arc::new(move |_handle| {
            flag.store(true, Ordering::SeqCst);
        });
        let mut lt = LoopThread::new("worker-init", Some(init));
        let _handle = lt.start();
        assert!(hooked.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_joins_cleanly() {
        let mut lt = LoopThread::new("worker-drop", None);
        let handle = lt.start();
        drop(lt);
        assert!(handle.is_stopped());
    }

    #[test]
    fn never_started_drop_is_a_no_op() {
        let lt = LoopThread::new("worker-idle", None);
        drop(lt);
    }
}
